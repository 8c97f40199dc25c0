//! 浏览器渲染期间的虚拟站点
//!
//! 页面里的相对地址（模板资源、脚本、背景、头像）全部由这里应答，
//! 监听地址只在一次渲染内有效。

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::features::background::provider::guess_mime;

const STOP_GRACE: Duration = Duration::from_secs(1);

/// 一次渲染所需的页面内容与资源位置
pub struct PageAssets {
    pub html: String,
    pub background: Bytes,
    pub template_res: PathBuf,
    pub js_dir: PathBuf,
    pub avatar: PathBuf,
}

type SharedAssets = Arc<PageAssets>;

pub fn page_router(assets: PageAssets) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/default/res/*path", get(template_res))
        .route("/js/:name", get(js))
        .route("/api/background", get(background))
        .route("/api/bot_avatar/:id", get(bot_avatar))
        .with_state(Arc::new(assets))
}

async fn index(State(assets): State<SharedAssets>) -> Html<String> {
    Html(assets.html.clone())
}

async fn template_res(State(assets): State<SharedAssets>, UrlPath(path): UrlPath<String>) -> Response {
    match confined_join(&assets.template_res, &path) {
        Some(p) => serve_file(&p).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn js(State(assets): State<SharedAssets>, UrlPath(name): UrlPath<String>) -> Response {
    match confined_join(&assets.js_dir, &name) {
        Some(p) => serve_file(&p).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn background(State(assets): State<SharedAssets>) -> Response {
    (
        [(header::CONTENT_TYPE, "image/jpeg")],
        assets.background.clone(),
    )
        .into_response()
}

async fn bot_avatar(State(assets): State<SharedAssets>, UrlPath(_id): UrlPath<String>) -> Response {
    serve_file(&assets.avatar).await
}

/// 只接受普通路径段，拒绝 `..`、根路径等越界写法
fn confined_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut components = rel.components().peekable();
    components.peek()?;
    components
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| root.join(rel))
}

fn content_type_for(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("css") => "text/css; charset=utf-8".to_string(),
        Some("js") => "text/javascript; charset=utf-8".to_string(),
        Some("html") => "text/html; charset=utf-8".to_string(),
        Some("svg") => "image/svg+xml".to_string(),
        Some("woff2") => "font/woff2".to_string(),
        Some("ttf") => "font/ttf".to_string(),
        _ => guess_mime(path),
    }
}

async fn serve_file(path: &Path) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type_for(path))], bytes).into_response(),
        Err(e) => {
            debug!("页面资源不存在: path={}, error={e}", path.display());
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// 在回环地址的临时端口上托管页面路由
pub struct PageServer {
    origin: String,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl PageServer {
    pub async fn start(router: Router) -> Result<Self, AppError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                warn!("页面服务异常退出: {e}");
            }
        });

        debug!("页面服务已启动: {addr}");
        Ok(Self {
            origin: format!("http://{addr}"),
            shutdown: Some(tx),
            task,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// 通知停止并等待片刻；浏览器残留的长连接不会拖住调用方
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(STOP_GRACE, &mut self.task).await.is_err() {
            debug!("页面服务未在宽限期内退出，强制终止");
        }
    }
}

impl Drop for PageServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
