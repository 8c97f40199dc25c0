use std::path::Path;

use minijinja::value::{Value as JinjaValue, ViaDeserialize};
use minijinja::{AutoEscape, Environment, context, path_loader};
use serde::{Deserialize, Serialize};

use super::facts::StatusFacts;
use crate::error::AppError;

pub const INDEX_TEMPLATE: &str = "index.html.jinja";

/// 默认启用的页面组件（按顺序渲染）
pub const DEFAULT_COMPONENTS: &[&str] = &["header", "cpu_mem", "disk", "network", "process", "footer"];

const BYTE_UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
const FREQ_UNITS: &[&str] = &["Hz", "KHz", "MHz", "GHz"];

/// 模板中可见的 `config` 对象
#[derive(Debug, Clone, Serialize)]
pub struct TemplateConfig {
    pub ps_default_components: Vec<String>,
    pub ps_default_additional_css: Vec<String>,
    pub ps_default_additional_script: Vec<String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            ps_default_components: DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect(),
            ps_default_additional_css: Vec::new(),
            ps_default_additional_script: Vec::new(),
        }
    }
}

/// 采集器给出的 CPU 频率（Hz）
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuFreq {
    #[serde(default)]
    pub current: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// HTML/XML 文本转义，SVG 合成层同样使用
pub(crate) fn escape_markup(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

pub fn percent_to_color(percent: f64) -> String {
    let class = if percent < 70.0 {
        "prog-low"
    } else if percent < 90.0 {
        "prog-medium"
    } else {
        "prog-high"
    };
    class.to_string()
}

/// 字节数自动换算单位；指定 `unit_index` 时数值原样输出，只替换单位
pub fn auto_convert_unit(
    value: f64,
    suffix: Option<String>,
    with_space: Option<bool>,
    unit_index: Option<usize>,
) -> String {
    let (v, idx) = match unit_index {
        Some(i) => (value, i.min(BYTE_UNITS.len() - 1)),
        None => {
            let mut v = value;
            let mut idx = 0;
            while v >= 1024.0 && idx < BYTE_UNITS.len() - 1 {
                v /= 1024.0;
                idx += 1;
            }
            (v, idx)
        }
    };
    let sp = if with_space.unwrap_or(false) { " " } else { "" };
    format!(
        "{v:.0}{sp}{}{}",
        BYTE_UNITS[idx],
        suffix.as_deref().unwrap_or("")
    )
}

fn format_hz(hz: Option<f64>) -> String {
    let Some(mut v) = hz.filter(|x| *x > 0.0) else {
        return "未知".to_string();
    };
    let mut idx = 0;
    while v >= 1000.0 && idx < FREQ_UNITS.len() - 1 {
        v /= 1000.0;
        idx += 1;
    }
    format!("{v:.0}{}", FREQ_UNITS[idx])
}

pub fn format_cpu_freq(freq: ViaDeserialize<CpuFreq>) -> String {
    let cur = format_hz(freq.current);
    match freq.max.filter(|m| *m > 0.0) {
        Some(max) => format!("{cur} / {}", format_hz(Some(max))),
        None => cur,
    }
}

/// 换行转为 `<br />`；内容先转义，结果标记为安全字符串
pub fn br(value: JinjaValue) -> JinjaValue {
    if value.is_undefined() || value.is_none() {
        return JinjaValue::from("");
    }
    let escaped = escape_markup(&value.to_string()).replace('\n', "<br />");
    JinjaValue::from_safe_string(escaped)
}

fn auto_escape_for(name: &str) -> AutoEscape {
    if name.contains(".html") || name.contains(".xml") {
        AutoEscape::Html
    } else {
        AutoEscape::None
    }
}

/// 浏览器渲染层的模板环境（从磁盘按需加载模板）
pub struct StatusTemplates {
    env: Environment<'static>,
}

impl StatusTemplates {
    /// `template_res` 为资源根目录，模板文件位于其 `templates/` 子目录
    pub fn new(template_res: &Path) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(template_res.join("templates")));
        env.set_auto_escape_callback(auto_escape_for);
        env.add_filter("percent_to_color", percent_to_color);
        env.add_filter("auto_convert_unit", auto_convert_unit);
        env.add_filter("format_cpu_freq", format_cpu_freq);
        env.add_filter("br", br);
        Self { env }
    }

    pub fn render_index(&self, facts: &StatusFacts) -> Result<String, AppError> {
        let tmpl = self
            .env
            .get_template(INDEX_TEMPLATE)
            .map_err(|e| AppError::ImageRendererError(format!("加载页面模板失败: {e}")))?;
        tmpl.render(context! {
            d => facts,
            config => TemplateConfig::default(),
        })
        .map_err(|e| AppError::ImageRendererError(format!("渲染页面模板失败: {e}")))
    }
}
