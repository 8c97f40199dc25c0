//! 分层渲染编排
//!
//! 依次尝试：宿主文转图 → 本地无头浏览器 → 静态合成。第一个成功的层即结束；
//! 只有所有启用的层都失败时才向上返回一条汇总后的错误。

use std::fmt;
use std::future::Future;

use tracing::{info, warn};

use super::facts::StatusFacts;
use super::t2i::{self, T2iOptions};
use crate::error::AppError;
use crate::features::background::BackgroundAsset;

const GENERIC_FAILURE: &str = "获取运行状态图片失败，请检查后台输出";
const T2I_HINT: &str = "（AstrBot t2i 未就绪/模板渲染失败）";
const HTML_HINT: &str =
    "（可能未安装 Chromium 或无法连接调试端点：请安装 chromium 或配置 renderer.cdp_url）";

/// 渲染层
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTier {
    /// 宿主提供的 HTML 转图片能力
    T2i,
    /// 本地无头浏览器
    Html,
    /// 静态图片合成（终极兜底）
    Static,
}

impl RenderTier {
    pub fn name(self) -> &'static str {
        match self {
            RenderTier::T2i => "t2i",
            RenderTier::Html => "html",
            RenderTier::Static => "static",
        }
    }

    fn hint(self) -> Option<&'static str> {
        match self {
            RenderTier::T2i => Some(T2I_HINT),
            RenderTier::Html => Some(HTML_HINT),
            RenderTier::Static => None,
        }
    }
}

impl fmt::Display for RenderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 渲染模式选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderMode {
    /// 三层全部启用
    #[default]
    Auto,
    /// 仅宿主文转图，失败后静态合成
    AstrT2i,
    /// 仅浏览器渲染，失败后静态合成
    Html,
    /// 仅浏览器渲染，失败即终止
    HtmlStrict,
    /// 仅静态合成
    Static,
}

impl RenderMode {
    /// 大小写不敏感；未识别的值视为只启用静态合成
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Self::Auto,
            "astr_t2i" => Self::AstrT2i,
            "html" => Self::Html,
            "html_strict" => Self::HtmlStrict,
            _ => Self::Static,
        }
    }

    /// 按顺序列出本模式会尝试的层
    pub fn plan(self) -> &'static [RenderTier] {
        match self {
            Self::Auto => &[RenderTier::T2i, RenderTier::Html, RenderTier::Static],
            Self::AstrT2i => &[RenderTier::T2i, RenderTier::Static],
            Self::Html => &[RenderTier::Html, RenderTier::Static],
            Self::HtmlStrict => &[RenderTier::Html],
            Self::Static => &[RenderTier::Static],
        }
    }

    fn aborts_on(self, tier: RenderTier) -> bool {
        self == Self::HtmlStrict && tier == RenderTier::Html
    }
}

/// 单层尝试记录，仅用于拼装失败信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderAttempt {
    pub tier: RenderTier,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// 所有启用的层都失败（或严格模式下浏览器层失败）
#[derive(Debug)]
pub struct StatusRenderError {
    attempts: Vec<RenderAttempt>,
}

impl StatusRenderError {
    fn new(attempts: Vec<RenderAttempt>) -> Self {
        Self { attempts }
    }

    pub fn attempts(&self) -> &[RenderAttempt] {
        &self.attempts
    }

    /// 面向用户的汇总信息：通用提示 + 实际尝试且失败的层的排查建议
    pub fn user_message(&self) -> String {
        let mut msg = GENERIC_FAILURE.to_string();
        for attempt in self.attempts.iter().filter(|a| !a.succeeded) {
            if let Some(hint) = attempt.tier.hint() {
                msg.push_str(hint);
            }
        }
        msg
    }
}

impl fmt::Display for StatusRenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.user_message())
    }
}

impl std::error::Error for StatusRenderError {}

/// 渲染结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedImage {
    /// 宿主返回的图片地址
    Url(String),
    /// JPEG 字节
    Jpeg(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub tier: RenderTier,
    pub image: RenderedImage,
    pub attempts: Vec<RenderAttempt>,
}

/// 第一层：宿主 HTML 转图片，返回产物地址
pub trait HostRenderer: Send + Sync {
    fn render_html(
        &self,
        html: String,
        options: &T2iOptions,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// 第二层：本地浏览器渲染模板，返回 JPEG
pub trait BrowserRenderer: Send + Sync {
    fn render(
        &self,
        facts: &StatusFacts,
        background: &BackgroundAsset,
    ) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;
}

/// 第三层：静态合成，视为总是可用
pub trait StaticComposer: Send + Sync {
    fn compose(
        &self,
        facts: &StatusFacts,
        background: &BackgroundAsset,
    ) -> impl Future<Output = Result<Vec<u8>, AppError>> + Send;
}

/// 三层渲染编排器
pub struct StatusRenderer<H, B, C> {
    host: H,
    browser: B,
    composer: C,
}

impl<H, B, C> StatusRenderer<H, B, C>
where
    H: HostRenderer,
    B: BrowserRenderer,
    C: StaticComposer,
{
    pub fn new(host: H, browser: B, composer: C) -> Self {
        Self {
            host,
            browser,
            composer,
        }
    }

    pub async fn render(
        &self,
        mode: RenderMode,
        facts: &StatusFacts,
        background: &BackgroundAsset,
    ) -> Result<RenderOutcome, StatusRenderError> {
        let mut attempts = Vec::with_capacity(3);

        for &tier in mode.plan() {
            match self.try_tier(tier, facts, background).await {
                Ok(image) => {
                    info!("状态图渲染完成: tier={tier}");
                    attempts.push(RenderAttempt {
                        tier,
                        succeeded: true,
                        error: None,
                    });
                    return Ok(RenderOutcome {
                        tier,
                        image,
                        attempts,
                    });
                }
                Err(e) => {
                    warn!(
                        "渲染层不可用: tier={tier}, reason={e}{}",
                        tier.hint().unwrap_or_default()
                    );
                    attempts.push(RenderAttempt {
                        tier,
                        succeeded: false,
                        error: Some(e.to_string()),
                    });
                    if mode.aborts_on(tier) {
                        break;
                    }
                }
            }
        }

        Err(StatusRenderError::new(attempts))
    }

    async fn try_tier(
        &self,
        tier: RenderTier,
        facts: &StatusFacts,
        background: &BackgroundAsset,
    ) -> Result<RenderedImage, AppError> {
        match tier {
            RenderTier::T2i => {
                let html = t2i::build_default_html(facts, background)?;
                let url = self.host.render_html(html, &T2iOptions::default()).await?;
                Ok(RenderedImage::Url(url))
            }
            RenderTier::Html => self
                .browser
                .render(facts, background)
                .await
                .map(RenderedImage::Jpeg),
            RenderTier::Static => self
                .composer
                .compose(facts, background)
                .await
                .map(RenderedImage::Jpeg),
        }
    }
}
