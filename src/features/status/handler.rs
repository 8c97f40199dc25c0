use std::path::{Path, PathBuf};

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Redirect, Response},
    routing::post,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as base64_engine};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::facts::StatusFacts;
use super::orchestrator::{RenderMode, RenderedImage};
use crate::error::AppError;
use crate::http;
use crate::state::AppState;

/// 状态图写入缓存目录时使用的文件名
pub const CACHED_IMAGE_NAME: &str = "status.jpg";

/// 响应头：实际产出图片的渲染层
pub const RENDER_TIER_HEADER: &str = "x-render-tier";

/// 状态图请求体
#[derive(Debug, Default, Deserialize)]
pub struct StatusImageRequest {
    /// 外部采集器给出的状态数据
    #[serde(default)]
    pub facts: Map<String, Value>,
    /// 调用方指定的背景图地址（仅 http/https）
    #[serde(default)]
    pub background_url: Option<String>,
    /// 调用方直接附带的背景图（base64，可带 data URI 前缀）
    #[serde(default)]
    pub background_base64: Option<String>,
    /// 覆盖配置中的背景来源
    #[serde(default)]
    pub provider: Option<String>,
    /// 覆盖配置中的本地图片路径（必须位于 `background.local_path` 之内）
    #[serde(default)]
    pub local_path: Option<String>,
    /// 覆盖配置中的渲染模式
    #[serde(default)]
    pub renderer: Option<String>,
}

fn decode_base64_image(raw: &str) -> Option<Bytes> {
    let payload = raw
        .trim()
        .strip_prefix("base64://")
        .or_else(|| raw.trim().split_once(";base64,").map(|(_, b)| b))
        .unwrap_or(raw.trim());
    match base64_engine.decode(payload) {
        Ok(bytes) if !bytes.is_empty() => Some(Bytes::from(bytes)),
        Ok(_) => None,
        Err(e) => {
            warn!("调用方背景 base64 无法解码，忽略: {e}");
            None
        }
    }
}

async fn download_image(url: &str, timeout_secs: u64) -> Result<Bytes, AppError> {
    let client = http::client_for(timeout_secs, None)?;
    let bytes = client.get(url).send().await?.error_for_status()?.bytes().await?;
    Ok(bytes)
}

/// 调用方自带的背景；任何失败都只记录日志，随后交给配置来源处理
async fn caller_background(req: &StatusImageRequest, timeout_secs: u64) -> Option<Bytes> {
    if let Some(raw) = req.background_base64.as_deref()
        && let Some(bytes) = decode_base64_image(raw)
    {
        return Some(bytes);
    }

    let url = req.background_url.as_deref()?.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        debug!("忽略非 http(s) 背景地址: {url}");
        return None;
    }
    match download_image(url, timeout_secs).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            warn!("下载调用方背景失败，改用配置来源: {e}");
            None
        }
    }
}

/// 请求体给出的本地路径只能落在运营方配置的 `background.local_path` 之内。
///
/// 两端都先规范化（解析 `..` 与符号链接），未配置根目录时一律拒绝。
async fn confine_local_path(root: Option<&str>, requested: &str) -> Result<PathBuf, AppError> {
    let Some(root) = root.filter(|r| !r.trim().is_empty()) else {
        return Err(AppError::Validation(
            "未配置 background.local_path，不接受请求指定的本地路径".to_string(),
        ));
    };
    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| AppError::Validation(format!("本地背景根目录不可用: {e}")))?;

    let requested = Path::new(requested.trim());
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };
    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| AppError::Validation(format!("本地背景路径不存在: {}", candidate.display())))?;

    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        warn!("拒绝越界的本地背景路径: {}", resolved.display());
        Err(AppError::Validation(
            "本地背景路径必须位于 background.local_path 之内".to_string(),
        ))
    }
}

/// 尽力写入缓存目录，失败不影响响应
async fn write_cached_image(cache_dir: &Path, bytes: &[u8]) {
    let path = cache_dir.join(CACHED_IMAGE_NAME);
    if let Err(e) = tokio::fs::write(&path, bytes).await {
        warn!("写入状态图缓存失败: path={}, error={e}", path.display());
    }
}

/// 生成运行状态图片
///
/// 第一层成功时以 303 重定向到宿主给出的图片地址；其余层直接返回 JPEG。
pub async fn render_status_image(
    State(state): State<AppState>,
    Json(mut req): Json<StatusImageRequest>,
) -> Result<Response, AppError> {
    let config = state.config.as_ref();
    let facts = StatusFacts::new(std::mem::take(&mut req.facts))
        .with_defaults(&config.renderer.bot_nick, "AstrBot");

    let prefer = caller_background(&req, config.background.user_image_timeout).await;
    let provider = req
        .provider
        .as_deref()
        .unwrap_or(config.background.provider.as_str());
    let local_path = match req.local_path.as_deref() {
        Some(requested) => Some(
            confine_local_path(config.background.local_path.as_deref(), requested).await?,
        ),
        None => config.background.local_path.as_deref().map(PathBuf::from),
    };
    let background = state
        .resolver
        .resolve(prefer, provider, local_path.as_deref(), &config.background)
        .await?;

    let mode = RenderMode::parse(req.renderer.as_deref().unwrap_or(config.renderer.mode.as_str()));
    let _permit = state
        .render_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AppError::Internal(format!("获取渲染信号量失败: {e}")))?;
    let outcome = state.renderer.render(mode, &facts, &background).await?;
    info!(
        "状态图已生成: mode={mode:?}, tier={}, attempts={}",
        outcome.tier,
        outcome.attempts.len()
    );

    let tier_header = (
        HeaderName::from_static(RENDER_TIER_HEADER),
        HeaderValue::from_static(outcome.tier.name()),
    );
    match outcome.image {
        RenderedImage::Url(url) => Ok(([tier_header], Redirect::to(&url)).into_response()),
        RenderedImage::Jpeg(bytes) => {
            write_cached_image(&config.cache_path(), &bytes).await;
            Ok((
                [
                    (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
                    tier_header,
                ],
                bytes,
            )
                .into_response())
        }
    }
}

pub fn create_status_router() -> Router<AppState> {
    Router::new().route("/status/image", post(render_status_image))
}
