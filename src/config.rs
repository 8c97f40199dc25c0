use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::features::background::{BackgroundProvider, MaturityFilter, ProviderConfig};

/// 全局配置单例
static CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: String,
    /// 日志格式
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3940,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

/// 资源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// 资源基础路径（模板、脚本、内置图片）
    pub base_path: String,
    /// 渲染产物缓存目录
    pub cache_dir: String,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            base_path: "./resources".to_string(),
            cache_dir: "./.cache".to_string(),
        }
    }
}

/// 背景图获取配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// 背景来源：loli / lolicon / local / none（大小写不敏感，未知值按 local 处理）
    #[serde(default = "BackgroundConfig::default_provider")]
    pub provider: String,
    /// 本地图片路径（文件或目录）
    #[serde(default)]
    pub local_path: Option<String>,
    /// 单次请求超时（秒）
    #[serde(default = "BackgroundConfig::default_timeout", alias = "req_timeout")]
    pub bg_req_timeout: u64,
    /// 请求代理
    #[serde(default, alias = "proxy")]
    pub bg_proxy: Option<String>,
    /// 预加载队列深度（>=1）
    #[serde(default = "BackgroundConfig::default_preload", alias = "preload_count")]
    pub bg_preload_count: usize,
    /// Lolicon 的 r18 过滤：0=关闭，1=仅 R18，2=混合
    #[serde(default, alias = "lolicon_r18_type")]
    pub bg_lolicon_r18_type: i64,
    /// 内置默认背景（兜底资源，缺失视为部署错误）
    #[serde(default = "BackgroundConfig::default_asset")]
    pub default_asset: String,
    /// 下载调用方附带图片的超时（秒）
    #[serde(default = "BackgroundConfig::default_user_image_timeout")]
    pub user_image_timeout: u64,
}

impl BackgroundConfig {
    fn default_provider() -> String {
        "loli".to_string()
    }
    fn default_timeout() -> u64 {
        10
    }
    fn default_preload() -> usize {
        1
    }
    fn default_asset() -> String {
        "./resources/assets/default_bg.png".to_string()
    }
    fn default_user_image_timeout() -> u64 {
        5
    }

    /// 计算生效的 ProviderConfig（预加载深度至少为 1，r18 取值截断到 0..=2）
    pub fn provider_config(&self, provider: &str, local_path: Option<&Path>) -> ProviderConfig {
        ProviderConfig {
            provider: BackgroundProvider::parse(provider),
            local_path: local_path.map(Path::to_path_buf),
            timeout_secs: self.bg_req_timeout,
            proxy: self.bg_proxy.clone().filter(|p| !p.trim().is_empty()),
            preload_count: self.bg_preload_count.max(1),
            maturity: MaturityFilter::clamped(self.bg_lolicon_r18_type),
        }
    }

    /// 默认背景的完整路径
    pub fn default_asset_path(&self) -> PathBuf {
        PathBuf::from(&self.default_asset)
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            local_path: None,
            bg_req_timeout: Self::default_timeout(),
            bg_proxy: None,
            bg_preload_count: Self::default_preload(),
            bg_lolicon_r18_type: 0,
            default_asset: Self::default_asset(),
            user_image_timeout: Self::default_user_image_timeout(),
        }
    }
}

/// 状态图渲染配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    /// 渲染模式：auto / astr_t2i / html / html_strict / pillow
    #[serde(default = "RendererConfig::default_mode")]
    pub mode: String,
    /// 外部 Chrome 调试端点（设置后不再自行启动浏览器）
    #[serde(default)]
    pub cdp_url: Option<String>,
    /// 文转图服务地址（未配置时第一层直接失败并回退）
    #[serde(default)]
    pub t2i_endpoint: Option<String>,
    /// 文转图服务鉴权令牌（可选）
    #[serde(default)]
    pub t2i_token: Option<String>,
    /// 等待页面完成标记的超时（秒）
    #[serde(default = "RendererConfig::default_browser_timeout")]
    pub browser_timeout_secs: u64,
    /// 状态卡片头部显示的机器人昵称
    #[serde(default = "RendererConfig::default_bot_nick")]
    pub bot_nick: String,
    /// 同时进行的渲染数上限（浏览器实例开销大）
    #[serde(default = "RendererConfig::default_max_concurrent")]
    pub max_concurrent_renders: usize,
}

impl RendererConfig {
    fn default_mode() -> String {
        "auto".to_string()
    }
    fn default_browser_timeout() -> u64 {
        30
    }
    fn default_bot_nick() -> String {
        "AstrBot".to_string()
    }
    fn default_max_concurrent() -> usize {
        2
    }

    /// 获取等待页面完成的超时时间
    pub fn browser_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.browser_timeout_secs.max(1))
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
            cdp_url: None,
            t2i_endpoint: None,
            t2i_token: None,
            browser_timeout_secs: Self::default_browser_timeout(),
            bot_nick: Self::default_bot_nick(),
            max_concurrent_renders: Self::default_max_concurrent(),
        }
    }
}

/// 优雅退出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// 优雅退出超时时间（秒）
    #[serde(default = "ShutdownConfig::default_timeout")]
    pub timeout_secs: u64,
}

impl ShutdownConfig {
    fn default_timeout() -> u64 {
        30
    }

    /// 获取优雅退出超时时间
    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub resources: ResourcesConfig,
    /// 背景图获取配置
    #[serde(default)]
    pub background: BackgroundConfig,
    /// 渲染配置
    #[serde(default)]
    pub renderer: RendererConfig,
    /// 优雅退出配置
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// 指定配置文件路径的环境变量
const CONFIG_PATH_ENV: &str = "PICSTATUS_CONFIG";

/// 旧版插件使用的扁平环境变量 -> 配置键
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("PICSTATUS_BG_PROVIDER", "background.provider"),
    ("PICSTATUS_BG_LOCAL_PATH", "background.local_path"),
    ("PICSTATUS_RENDERER", "renderer.mode"),
    ("PICSTATUS_PW_CDP", "renderer.cdp_url"),
    ("PICSTATUS_BOT_NICK", "renderer.bot_nick"),
];

impl AppConfig {
    /// 从配置文件加载配置，支持环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::get_config_path(), None)
    }

    /// 指定配置文件与环境变量来源加载；`vars` 为 `None` 时读取进程环境
    pub fn load_from(
        config_path: &Path,
        vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        tracing::info!("正在从 {:?} 加载配置文件", config_path);

        let mut vars = vars.unwrap_or_else(|| std::env::vars().collect());
        // 扁平变量会被映射成同名顶层键（如 `renderer`），覆盖整节配置，只能走显式 override
        let legacy: Vec<_> = LEGACY_ENV_OVERRIDES
            .iter()
            .map(|(var, key)| (*key, vars.remove(*var).filter(|v| !v.trim().is_empty())))
            .collect();
        vars.remove(CONFIG_PATH_ENV);

        let mut builder = ConfigBuilder::builder()
            // 配置文件与各节字段均可缺省，缺失字段使用默认值
            .add_source(File::from(config_path).required(false))
            // 支持环境变量覆盖，例如：PICSTATUS_BACKGROUND__BG_PROXY
            .add_source(
                Environment::with_prefix("PICSTATUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(vars)),
            );

        for (key, value) in legacy {
            builder = builder.set_override_option(key, value)?;
        }

        let config: Self = builder.build()?.try_deserialize()?;

        tracing::debug!(
            "配置加载完成: provider = {}, renderer = {}",
            config.background.provider,
            config.renderer.mode
        );

        Ok(config)
    }

    /// 获取全局配置单例
    pub fn global() -> &'static AppConfig {
        CONFIG.get().expect("配置未初始化，请先调用 init_global()")
    }

    /// 初始化全局配置
    pub fn init_global() -> Result<(), ConfigError> {
        let config = Self::load()?;
        CONFIG
            .set(config)
            .map_err(|_| ConfigError::Message("配置已经被初始化".to_string()))?;
        Ok(())
    }

    /// 获取配置文件路径
    fn get_config_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"))
    }

    /// 获取服务器监听地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 获取资源文件夹路径
    pub fn resources_path(&self) -> PathBuf {
        PathBuf::from(&self.resources.base_path)
    }

    /// 获取渲染产物缓存目录
    pub fn cache_path(&self) -> PathBuf {
        PathBuf::from(&self.resources.cache_dir)
    }

    /// 浏览器渲染层的模板资源根目录（`templates/`、`css/` 等位于其下）
    pub fn template_res_path(&self) -> PathBuf {
        self.resources_path().join("templates").join("default").join("res")
    }

    pub fn js_path(&self) -> PathBuf {
        self.resources_path().join("js")
    }

    pub fn avatar_path(&self) -> PathBuf {
        self.resources_path().join("assets").join("default_avatar.png")
    }

    /// 静态合成层额外加载的字体目录
    pub fn fonts_path(&self) -> PathBuf {
        self.resources_path().join("fonts")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            resources: ResourcesConfig::default(),
            background: BackgroundConfig::default(),
            renderer: RendererConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}
