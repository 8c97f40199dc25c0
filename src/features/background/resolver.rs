use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use tracing::info;

use super::preloader::Preloader;
use super::provider::{ProviderEndpoints, ProviderSource};
use super::types::{BackgroundAsset, ProviderConfig};
use crate::config::BackgroundConfig;
use crate::error::AppError;

/// 调用方自带图片时使用的 Content-Type（不做嗅探）
const PREFERRED_BYTES_MIME: &str = "image";

/// 背景解析入口：调用方图片 > 配置来源（经预加载器）> 内置默认背景。
///
/// 同一时刻只缓存一个预加载器；生效配置变化时旧实例被退役并替换，
/// 避免旧来源排队的图片泄漏到新配置。
pub struct BackgroundResolver {
    endpoints: ProviderEndpoints,
    default_asset: PathBuf,
    cached: Mutex<Option<Arc<Preloader>>>,
}

impl BackgroundResolver {
    pub fn new(default_asset: PathBuf) -> Self {
        Self::with_endpoints(default_asset, ProviderEndpoints::default())
    }

    pub fn with_endpoints(default_asset: PathBuf, endpoints: ProviderEndpoints) -> Self {
        Self {
            endpoints,
            default_asset,
            cached: Mutex::new(None),
        }
    }

    pub fn default_asset(&self) -> &Path {
        &self.default_asset
    }

    /// 解析一张背景。`prefer_bytes` 非空时原样返回，不触碰缓存。
    pub async fn resolve(
        &self,
        prefer_bytes: Option<Bytes>,
        provider: &str,
        local_path: Option<&Path>,
        config: &BackgroundConfig,
    ) -> Result<BackgroundAsset, AppError> {
        if let Some(bytes) = prefer_bytes.filter(|b| !b.is_empty()) {
            return Ok(BackgroundAsset::new(bytes, PREFERRED_BYTES_MIME));
        }

        let effective = config.provider_config(provider, local_path);
        self.preloader_for(effective)?.get().await
    }

    /// 取出（或创建）与配置完全一致的预加载器。
    pub fn preloader_for(&self, config: ProviderConfig) -> Result<Arc<Preloader>, AppError> {
        let mut slot = self
            .cached
            .lock()
            .map_err(|_| AppError::Internal("预加载器缓存锁已中毒".to_string()))?;

        if let Some(current) = slot.as_ref()
            && current.source().config() == &config
        {
            return Ok(current.clone());
        }

        if let Some(old) = slot.take() {
            info!(
                "背景配置变化，替换预加载器: {} -> {}",
                old.source().config().provider,
                config.provider
            );
            old.retire();
        }

        let depth = config.preload_count;
        let source = ProviderSource::new(config, self.endpoints.clone(), self.default_asset.clone());
        let preloader = Arc::new(Preloader::new(source, depth, self.default_asset.clone()));
        *slot = Some(preloader.clone());
        Ok(preloader)
    }

    /// 当前缓存的预加载器（若有）
    pub fn cached(&self) -> Option<Arc<Preloader>> {
        self.cached.lock().ok().and_then(|g| g.clone())
    }
}
