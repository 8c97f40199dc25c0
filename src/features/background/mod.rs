mod preloader;
pub mod provider;
mod resolver;
mod types;

pub use preloader::Preloader;
pub use provider::{AssetSource, ProviderEndpoints, ProviderSource};
pub use resolver::BackgroundResolver;
pub use types::{BackgroundAsset, BackgroundProvider, MaturityFilter, ProviderConfig};
