use std::fmt;
use std::path::PathBuf;

use axum::body::Bytes;

/// 已解析的背景图：原始字节 + Content-Type。
///
/// 构造后不可变；`Bytes` 克隆只增加引用计数，渲染层以只读方式消费。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundAsset {
    data: Bytes,
    mime: String,
}

impl BackgroundAsset {
    pub fn new(data: impl Into<Bytes>, mime: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime: mime.into(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 可直接用于 `data:` URI 的图片类型；标注不完整（如调用方图片的 "image"）时按内容嗅探
    pub fn image_mime(&self) -> &str {
        if self.mime.starts_with("image/") {
            return &self.mime;
        }
        image::guess_format(&self.data)
            .map(|f| f.to_mime_type())
            .unwrap_or("image/jpeg")
    }
}

/// 背景图来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackgroundProvider {
    /// loliapi 随机二次元图
    Loli,
    /// Lolicon API（先搜索再下载 Pixiv 原图）
    Lolicon,
    /// 本地文件或目录
    Local,
    /// 始终使用内置默认背景
    None,
}

impl BackgroundProvider {
    /// 大小写不敏感解析；无法识别的值按 `Local` 处理，而不是报错。
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "loli" => Self::Loli,
            "lolicon" => Self::Lolicon,
            "none" => Self::None,
            _ => Self::Local,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Loli => "loli",
            Self::Lolicon => "lolicon",
            Self::Local => "local",
            Self::None => "none",
        }
    }
}

impl fmt::Display for BackgroundProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lolicon 搜索的内容分级过滤（对应 API 的 `r18` 参数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MaturityFilter {
    /// 0：仅全年龄
    #[default]
    Off,
    /// 1：仅 R18
    Restricted,
    /// 2：混合
    Mixed,
}

impl MaturityFilter {
    /// 越界值截断到 0..=2
    pub fn clamped(level: i64) -> Self {
        match level.clamp(0, 2) {
            0 => Self::Off,
            1 => Self::Restricted,
            _ => Self::Mixed,
        }
    }

    pub fn as_param(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Restricted => 1,
            Self::Mixed => 2,
        }
    }
}

/// 决定获取行为的完整参数组；相等即视为同一个预加载器缓存键。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderConfig {
    pub provider: BackgroundProvider,
    pub local_path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub proxy: Option<String>,
    pub preload_count: usize,
    pub maturity: MaturityFilter,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: BackgroundProvider::Loli,
            local_path: None,
            timeout_secs: 10,
            proxy: None,
            preload_count: 1,
            maturity: MaturityFilter::Off,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_is_case_insensitive_and_defaults_to_local() {
        assert_eq!(BackgroundProvider::parse("LOLI"), BackgroundProvider::Loli);
        assert_eq!(
            BackgroundProvider::parse(" Lolicon "),
            BackgroundProvider::Lolicon
        );
        assert_eq!(BackgroundProvider::parse("None"), BackgroundProvider::None);
        assert_eq!(BackgroundProvider::parse("pixiv"), BackgroundProvider::Local);
        assert_eq!(BackgroundProvider::parse(""), BackgroundProvider::Local);
    }

    #[test]
    fn maturity_filter_clamps_out_of_range_levels() {
        assert_eq!(MaturityFilter::clamped(-3), MaturityFilter::Off);
        assert_eq!(MaturityFilter::clamped(1).as_param(), 1);
        assert_eq!(MaturityFilter::clamped(99), MaturityFilter::Mixed);
    }

    #[test]
    fn image_mime_sniffs_incomplete_labels() {
        let png_magic = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR".to_vec();
        assert_eq!(BackgroundAsset::new(png_magic, "image").image_mime(), "image/png");
        assert_eq!(BackgroundAsset::new(&b"??"[..], "image").image_mime(), "image/jpeg");
        assert_eq!(BackgroundAsset::new(&b"??"[..], "image/webp").image_mime(), "image/webp");
    }

    #[test]
    fn configs_differing_in_one_field_are_distinct_keys() {
        let a = ProviderConfig::default();
        let b = ProviderConfig {
            timeout_secs: 11,
            ..ProviderConfig::default()
        };
        assert_eq!(a, ProviderConfig::default());
        assert_ne!(a, b);
    }
}
