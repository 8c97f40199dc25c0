use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::features::background::BackgroundResolver;
use crate::features::status::DefaultStatusRenderer;

/// 聚合的应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// 背景解析（内部缓存当前配置对应的预加载器）
    pub resolver: Arc<BackgroundResolver>,
    /// 三层渲染编排
    pub renderer: Arc<DefaultStatusRenderer>,
    /// 控制并发渲染的信号量（浏览器实例开销大）
    pub render_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn from_config(config: AppConfig) -> Self {
        let resolver = BackgroundResolver::new(config.background.default_asset_path());
        let renderer = DefaultStatusRenderer::from_config(&config);
        let permits = config.renderer.max_concurrent_renders.max(1);
        Self {
            config: Arc::new(config),
            resolver: Arc::new(resolver),
            renderer: Arc::new(renderer),
            render_semaphore: Arc::new(Semaphore::new(permits)),
        }
    }
}
