//! 第二层：本地无头浏览器
//!
//! 模板渲染成 HTML 后交给临时页面服务托管，浏览器打开页面、等待 `body.done`，
//! 再对 `.main-background` 元素截图。无论成功与否，页面服务与浏览器都会被释放。

use std::path::PathBuf;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::facts::StatusFacts;
use super::orchestrator::BrowserRenderer;
use super::page_router::{PageAssets, PageServer, page_router};
use super::template::StatusTemplates;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::features::background::BackgroundAsset;

const READY_SELECTOR: &str = "body.done";
const CAPTURE_SELECTOR: &str = ".main-background";
const READY_POLL: Duration = Duration::from_millis(100);
const RELEASE_GRACE: Duration = Duration::from_secs(5);

fn cdp_error(stage: &str) -> impl FnOnce(chromiumoxide::error::CdpError) -> AppError + '_ {
    move |e| AppError::ImageRendererError(format!("{stage}: {e}"))
}

/// 一次渲染独占的浏览器连接
struct BrowserSession {
    browser: Browser,
    handler: Option<JoinHandle<()>>,
    page: Option<Page>,
    /// 由本进程启动（而不是附着到外部实例）
    launched: bool,
}

impl BrowserSession {
    async fn open(cdp_url: Option<&str>) -> Result<Self, AppError> {
        let (browser, mut handler, launched) = match cdp_url {
            Some(url) => {
                let (b, h) = Browser::connect(url)
                    .await
                    .map_err(cdp_error("连接浏览器调试端点失败"))?;
                (b, h, false)
            }
            None => {
                let config = BrowserConfig::builder()
                    .no_sandbox()
                    .build()
                    .map_err(|e| AppError::ImageRendererError(format!("浏览器配置无效: {e}")))?;
                let (b, h) = Browser::launch(config)
                    .await
                    .map_err(cdp_error("启动 Chromium 失败"))?;
                (b, h, true)
            }
        };

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("CDP 事件处理出错: {e}");
                }
            }
        });

        Ok(Self {
            browser,
            handler: Some(handler),
            page: None,
            launched,
        })
    }

    async fn capture(&mut self, origin: &str) -> Result<Vec<u8>, AppError> {
        let page = self
            .browser
            .new_page(CreateTargetParams::new(format!("{origin}/")))
            .await
            .map_err(cdp_error("打开页面失败"))?;
        self.page = Some(page.clone());

        while page.find_element(READY_SELECTOR).await.is_err() {
            sleep(READY_POLL).await;
        }

        page.find_element(CAPTURE_SELECTOR)
            .await
            .map_err(cdp_error("未找到截图区域"))?
            .screenshot(CaptureScreenshotFormat::Jpeg)
            .await
            .map_err(cdp_error("截图失败"))
    }

    /// 外部实例只关闭本次打开的页面；自行启动的浏览器整体关闭
    async fn release(mut self) {
        if let Some(page) = self.page.take()
            && let Err(e) = page.close().await
        {
            debug!("关闭页面失败: {e}");
        }
        if self.launched {
            if let Err(e) = self.browser.close().await {
                debug!("关闭浏览器失败: {e}");
            }
            if let Err(e) = self.browser.wait().await {
                debug!("等待浏览器进程退出失败: {e}");
            }
        }
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
    }
}

/// 请求被取消（或释放超时）时 `release()` 没有跑完：尽力关闭页面后再停掉 CDP 事件任务。
/// 自行启动的浏览器进程由 `Browser` 自身的 Drop 回收。
impl Drop for BrowserSession {
    fn drop(&mut self) {
        let close_page = self.page.take().map(|page| async move {
            if let Err(e) = page.close().await {
                debug!("回收时关闭页面失败: {e}");
            }
        });
        spawn_cleanup(close_page, self.handler.take());
    }
}

/// 先关闭页面（需要事件任务仍在运行），再中止事件任务；没有运行时或页面时直接中止。
fn spawn_cleanup<F>(close_page: Option<F>, handler: Option<JoinHandle<()>>)
where
    F: Future<Output = ()> + Send + 'static,
{
    let stop = move |handler: Option<JoinHandle<()>>| {
        if let Some(h) = handler {
            h.abort();
        }
    };
    match (close_page, tokio::runtime::Handle::try_current()) {
        (Some(close), Ok(rt)) => {
            rt.spawn(async move {
                if timeout(RELEASE_GRACE, close).await.is_err() {
                    debug!("回收时关闭页面超时");
                }
                stop(handler);
            });
        }
        _ => stop(handler),
    }
}

/// 基于 Chromium 的页面截图渲染
pub struct HeadlessBrowserRenderer {
    templates: StatusTemplates,
    template_res: PathBuf,
    js_dir: PathBuf,
    avatar: PathBuf,
    cdp_url: Option<String>,
    timeout: Duration,
}

impl HeadlessBrowserRenderer {
    pub fn new(
        template_res: PathBuf,
        js_dir: PathBuf,
        avatar: PathBuf,
        cdp_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            templates: StatusTemplates::new(&template_res),
            template_res,
            js_dir,
            avatar,
            cdp_url: cdp_url.filter(|u| !u.trim().is_empty()),
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.template_res_path(),
            config.js_path(),
            config.avatar_path(),
            config.renderer.cdp_url.clone(),
            config.renderer.browser_timeout(),
        )
    }

    async fn capture_page(&self, origin: &str) -> Result<Vec<u8>, AppError> {
        let mut session = timeout(self.timeout, BrowserSession::open(self.cdp_url.as_deref()))
            .await
            .map_err(|_| AppError::Timeout("连接浏览器超时".to_string()))??;

        let shot = match timeout(self.timeout, session.capture(origin)).await {
            Ok(r) => r,
            Err(_) => Err(AppError::Timeout(format!(
                "等待页面就绪超时（{}s）",
                self.timeout.as_secs()
            ))),
        };

        if timeout(RELEASE_GRACE, session.release()).await.is_err() {
            warn!("释放浏览器超时，进程将随句柄回收");
        }
        shot
    }
}

impl BrowserRenderer for HeadlessBrowserRenderer {
    async fn render(
        &self,
        facts: &StatusFacts,
        background: &BackgroundAsset,
    ) -> Result<Vec<u8>, AppError> {
        let html = self.templates.render_index(facts)?;
        let server = PageServer::start(page_router(PageAssets {
            html,
            background: background.data().clone(),
            template_res: self.template_res.clone(),
            js_dir: self.js_dir.clone(),
            avatar: self.avatar.clone(),
        }))
        .await?;

        let result = self.capture_page(server.origin()).await;
        server.stop().await;

        if let Ok(bytes) = &result {
            info!("浏览器截图完成: {} bytes", bytes.len());
        }
        result
    }
}
