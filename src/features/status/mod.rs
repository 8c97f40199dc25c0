mod browser;
mod composer;
mod facts;
pub mod handler;
mod orchestrator;
mod page_router;
mod t2i;
mod template;

pub use browser::HeadlessBrowserRenderer;
pub use composer::SvgCardComposer;
pub use facts::StatusFacts;
pub use handler::{StatusImageRequest, create_status_router};
pub use orchestrator::{
    BrowserRenderer, HostRenderer, RenderAttempt, RenderMode, RenderOutcome, RenderTier,
    RenderedImage, StaticComposer, StatusRenderError, StatusRenderer,
};
pub use page_router::{PageAssets, PageServer, page_router};
pub use t2i::{T2iOptions, T2iServiceRenderer, build_default_html};
pub use template::{INDEX_TEMPLATE, StatusTemplates};

use crate::config::AppConfig;

/// 生产环境使用的三层渲染器组合
pub type DefaultStatusRenderer =
    StatusRenderer<T2iServiceRenderer, HeadlessBrowserRenderer, SvgCardComposer>;

impl DefaultStatusRenderer {
    pub fn from_config(config: &AppConfig) -> Self {
        StatusRenderer::new(
            T2iServiceRenderer::new(
                config.renderer.t2i_endpoint.clone(),
                config.renderer.t2i_token.clone(),
                config.renderer.browser_timeout_secs,
            ),
            HeadlessBrowserRenderer::from_config(config),
            SvgCardComposer::from_config(config),
        )
    }
}
