use std::future::Future;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use rand::seq::SliceRandom;
use reqwest::header::{CONTENT_TYPE, REFERER};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::types::{BackgroundAsset, BackgroundProvider, MaturityFilter, ProviderConfig};
use crate::error::AppError;
use crate::http;

const LOLI_URL: &str = "https://www.loliapi.com/acg/pe/";
const LOLICON_SEARCH_URL: &str = "https://api.lolicon.app/setu/v2";
const PIXIV_REFERER: &str = "https://www.pixiv.net/";
const GENERIC_IMAGE_MIME: &str = "image/jpeg";
const GENERIC_BINARY_MIME: &str = "application/octet-stream";

/// 单次获取失败的原因；只在本模块内流转，出模块前一律转为 `None` 并记录告警。
#[derive(Debug, Error)]
enum FetchError {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("搜索结果为空")]
    EmptyResult,
    #[error("搜索结果中缺少原图地址")]
    MissingUrl,
}

impl FetchError {
    /// 稳定的错误类别，用于日志检索
    fn kind(&self) -> &'static str {
        match self {
            FetchError::Http(e) if e.is_timeout() => "Timeout",
            FetchError::Http(e) if e.is_status() => "HttpStatus",
            FetchError::Http(e) if e.is_decode() => "Decode",
            FetchError::Http(e) if e.is_builder() => "Builder",
            FetchError::Http(_) => "Network",
            FetchError::Io(_) => "Io",
            FetchError::EmptyResult => "EmptyResult",
            FetchError::MissingUrl => "MissingUrl",
        }
    }
}

/// 远程来源的端点；测试时可替换为本地服务。
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub loli_url: String,
    pub lolicon_search_url: String,
    pub lolicon_referer: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            loli_url: LOLI_URL.to_string(),
            lolicon_search_url: LOLICON_SEARCH_URL.to_string(),
            lolicon_referer: PIXIV_REFERER.to_string(),
        }
    }
}

/// 可被预加载器驱动的背景来源。
///
/// 约定：实现方不得向调用方抛出错误，任何失败都表现为 `None`。
pub trait AssetSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Option<BackgroundAsset>> + Send;

    /// 来源名称，用于日志
    fn name(&self) -> &str;
}

/// 按 `ProviderConfig` 分派到具体来源的默认实现。
#[derive(Debug, Clone)]
pub struct ProviderSource {
    config: ProviderConfig,
    endpoints: ProviderEndpoints,
    default_asset: PathBuf,
}

impl ProviderSource {
    pub fn new(config: ProviderConfig, endpoints: ProviderEndpoints, default_asset: PathBuf) -> Self {
        Self {
            config,
            endpoints,
            default_asset,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

impl AssetSource for ProviderSource {
    async fn fetch(&self) -> Option<BackgroundAsset> {
        let cfg = &self.config;
        let proxy = cfg.proxy.as_deref();
        match cfg.provider {
            BackgroundProvider::Loli => {
                fetch_loli(&self.endpoints.loli_url, cfg.timeout_secs, proxy).await
            }
            BackgroundProvider::Lolicon => {
                fetch_lolicon(&self.endpoints, cfg.timeout_secs, proxy, cfg.maturity).await
            }
            BackgroundProvider::Local => {
                let path = cfg.local_path.as_deref().unwrap_or(&self.default_asset);
                read_local(path, &self.default_asset).await
            }
            BackgroundProvider::None => read_local(&self.default_asset, &self.default_asset).await,
        }
    }

    fn name(&self) -> &str {
        self.config.provider.name()
    }
}

fn absent_on_error(
    source: &str,
    result: Result<BackgroundAsset, FetchError>,
) -> Option<BackgroundAsset> {
    match result {
        Ok(asset) => {
            debug!("背景获取成功: source={source}, bytes={}, mime={}", asset.len(), asset.mime());
            Some(asset)
        }
        Err(e) => {
            warn!("背景获取失败: source={source}, kind={}, error={e}", e.kind());
            None
        }
    }
}

fn content_type_or(resp: &reqwest::Response, fallback: &str) -> String {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// 随机图接口：单次 GET，Content-Type 缺省为 image/jpeg
pub async fn fetch_loli(url: &str, timeout_secs: u64, proxy: Option<&str>) -> Option<BackgroundAsset> {
    absent_on_error("loli", try_fetch_loli(url, timeout_secs, proxy).await)
}

async fn try_fetch_loli(
    url: &str,
    timeout_secs: u64,
    proxy: Option<&str>,
) -> Result<BackgroundAsset, FetchError> {
    let client = http::client_for(timeout_secs, proxy)?;
    let resp = client.get(url).send().await?.error_for_status()?;
    let mime = content_type_or(&resp, GENERIC_IMAGE_MIME);
    let data = resp.bytes().await?;
    Ok(BackgroundAsset::new(data, mime))
}

#[derive(Debug, Deserialize)]
struct LoliconResponse {
    #[serde(default)]
    data: Option<Vec<LoliconItem>>,
}

#[derive(Debug, Deserialize)]
struct LoliconItem {
    #[serde(default)]
    urls: Option<LoliconUrls>,
}

#[derive(Debug, Deserialize)]
struct LoliconUrls {
    #[serde(default)]
    original: Option<String>,
}

/// Lolicon：先搜索拿到原图地址，再带 Referer 下载；两次请求共用同一个 client。
pub async fn fetch_lolicon(
    endpoints: &ProviderEndpoints,
    timeout_secs: u64,
    proxy: Option<&str>,
    maturity: MaturityFilter,
) -> Option<BackgroundAsset> {
    absent_on_error(
        "lolicon",
        try_fetch_lolicon(endpoints, timeout_secs, proxy, maturity).await,
    )
}

async fn try_fetch_lolicon(
    endpoints: &ProviderEndpoints,
    timeout_secs: u64,
    proxy: Option<&str>,
    maturity: MaturityFilter,
) -> Result<BackgroundAsset, FetchError> {
    let client = http::client_for(timeout_secs, proxy)?;
    let r18 = maturity.as_param().to_string();
    let search: LoliconResponse = client
        .get(&endpoints.lolicon_search_url)
        .query(&[
            ("num", "1"),
            ("r18", r18.as_str()),
            ("proxy", "false"),
            ("excludeAI", "true"),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let first = search
        .data
        .and_then(|items| items.into_iter().next())
        .ok_or(FetchError::EmptyResult)?;
    let url = first
        .urls
        .and_then(|u| u.original)
        .filter(|u| !u.is_empty())
        .ok_or(FetchError::MissingUrl)?;

    let resp = client
        .get(&url)
        .header(REFERER, &endpoints.lolicon_referer)
        .send()
        .await?
        .error_for_status()?;
    let mime = content_type_or(&resp, GENERIC_IMAGE_MIME);
    let data = resp.bytes().await?;
    Ok(BackgroundAsset::new(data, mime))
}

/// 本地来源：目录则随机取一个直接子文件（空目录回退默认背景），文件则直接读取。
pub async fn read_local(path: &Path, default_asset: &Path) -> Option<BackgroundAsset> {
    absent_on_error("local", try_read_local(path, default_asset).await)
}

async fn try_read_local(path: &Path, default_asset: &Path) -> Result<BackgroundAsset, FetchError> {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);

    let target = if is_dir {
        let candidates = list_regular_files(path).await?;
        let picked = candidates.choose(&mut rand::thread_rng()).cloned();
        picked.unwrap_or_else(|| {
            debug!("本地背景目录为空，使用默认背景: {}", path.display());
            default_asset.to_path_buf()
        })
    } else {
        path.to_path_buf()
    };

    let data = tokio::fs::read(&target).await?;
    Ok(BackgroundAsset::new(data, guess_mime(&target)))
}

async fn list_regular_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        // 跟随符号链接判断
        if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
            files.push(path);
        }
    }
    Ok(files)
}

/// 按扩展名推断 Content-Type；webp/jpg/jpeg 显式指定，未知类型为 application/octet-stream。
pub fn guess_mime(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let mime = match ext.as_deref() {
        Some("webp") => "image/webp",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some(other) => ImageFormat::from_extension(other)
            .map(|f| f.to_mime_type())
            .unwrap_or(GENERIC_BINARY_MIME),
        None => GENERIC_BINARY_MIME,
    };
    mime.to_string()
}

/// 最终兜底：读取内置默认背景。缺失说明部署已损坏，必须向上报错而不是返回空图。
pub async fn read_default_asset(path: &Path) -> Result<BackgroundAsset, AppError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(BackgroundAsset::new(data, guess_mime(path))),
        Err(e) => {
            error!("默认背景读取失败（部署损坏）: path={}, error={e}", path.display());
            Err(AppError::DefaultAssetMissing(path.to_path_buf()))
        }
    }
}
