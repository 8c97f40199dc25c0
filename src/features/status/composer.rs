//! 第三层：静态合成
//!
//! 不依赖任何外部进程：拼一张 SVG 卡片（背景铺满 + 暗色遮罩 + 逐行状态），
//! 用 resvg 栅格化后编码为 JPEG。

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::{Engine as _, engine::general_purpose::STANDARD as base64_engine};
use chrono::Local;
use image::ColorType;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use resvg::tiny_skia::{Pixmap, Transform};
use resvg::usvg::{self, Options as UsvgOptions, fontdb};
use serde_json::Value;
use tokio::task::spawn_blocking;
use tracing::{error, warn};

use super::facts::StatusFacts;
use super::orchestrator::StaticComposer;
use super::template::escape_markup;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::features::background::BackgroundAsset;

const CARD_WIDTH: u32 = 800;
const MIN_CARD_HEIGHT: u32 = 480;
const HEADER_HEIGHT: u32 = 150;
const LINE_HEIGHT: u32 = 34;
const FOOTER_HEIGHT: u32 = 70;
/// 超出部分不再绘制，避免异常数据撑出超长图片
const MAX_LINES: usize = 40;
const MAX_VALUE_CHARS: usize = 48;
const MAIN_FONT_FAMILY: &str = "Noto Sans SC";
const BACKGROUND_JPEG_QUALITY: u8 = 85;
const OUTPUT_JPEG_QUALITY: u8 = 90;

static GLOBAL_FONT_DB: OnceLock<Arc<fontdb::Database>> = OnceLock::new();

fn init_font_db(fonts_dir: &Path) -> Arc<fontdb::Database> {
    let mut font_db = fontdb::Database::new();
    font_db.load_system_fonts();

    if let Ok(entries) = fs::read_dir(fonts_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_font = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("ttf" | "otf" | "ttc")
            );
            if path.is_file()
                && is_font
                && let Err(e) = font_db.load_font_file(&path)
            {
                error!("加载字体文件失败 '{}': {}", path.display(), e);
            }
        }
    }

    Arc::new(font_db)
}

fn font_db(fonts_dir: &Path) -> Arc<fontdb::Database> {
    GLOBAL_FONT_DB.get_or_init(|| init_font_db(fonts_dir)).clone()
}

/// 背景按卡片尺寸裁剪填充后编码为 JPEG data URI；无法解码时返回 None
fn background_data_uri(background: &BackgroundAsset, w: u32, h: u32) -> Option<String> {
    let img = match image::load_from_memory(background.data()) {
        Ok(img) => img,
        Err(e) => {
            warn!("背景图无法解码，使用纯色背景: {e}");
            return None;
        }
    };
    let rgb = img.resize_to_fill(w, h, FilterType::Triangle).to_rgb8();

    let mut out = Vec::new();
    let mut enc = JpegEncoder::new_with_quality(&mut out, BACKGROUND_JPEG_QUALITY);
    enc.encode(&rgb, w, h, ColorType::Rgb8.into()).ok()?;
    Some(format!(
        "data:image/jpeg;base64,{}",
        base64_engine.encode(out)
    ))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn display_value(value: &Value) -> String {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{f:.1}"),
            _ => n.to_string(),
        },
        other => other.to_string(),
    };
    truncate_chars(&raw.replace('\n', " "), MAX_VALUE_CHARS)
}

fn card_title(facts: &StatusFacts) -> String {
    facts
        .get("bots")
        .and_then(Value::as_array)
        .and_then(|bots| bots.first())
        .and_then(|bot| bot.get("nick"))
        .and_then(Value::as_str)
        .filter(|nick| !nick.is_empty())
        .map(|nick| format!("{nick} · 运行状态"))
        .unwrap_or_else(|| "运行状态".to_string())
}

/// 生成状态卡片 SVG，返回 (svg, 宽, 高)
pub fn build_card_svg(
    facts: &StatusFacts,
    background: &BackgroundAsset,
    generated_at: &str,
) -> (String, u32, u32) {
    let lines: Vec<(&String, &Value)> = facts
        .iter()
        .filter(|(k, _)| k.as_str() != "bots")
        .take(MAX_LINES)
        .collect();
    let w = CARD_WIDTH;
    let h = (HEADER_HEIGHT + LINE_HEIGHT * lines.len() as u32 + FOOTER_HEIGHT).max(MIN_CARD_HEIGHT);

    let mut svg = String::with_capacity(4096);
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#
    );
    let _ = write!(svg, r##"<rect width="{w}" height="{h}" fill="#1e1e24"/>"##);
    if let Some(uri) = background_data_uri(background, w, h) {
        let _ = write!(
            svg,
            r#"<image x="0" y="0" width="{w}" height="{h}" preserveAspectRatio="xMidYMid slice" xlink:href="{uri}"/>"#
        );
    }
    let _ = write!(
        svg,
        r##"<rect x="24" y="24" width="{}" height="{}" rx="16" fill="#000000" fill-opacity="0.55"/>"##,
        w - 48,
        h - 48
    );

    let _ = write!(
        svg,
        r##"<g font-family="{MAIN_FONT_FAMILY}, Microsoft YaHei, sans-serif" fill="#ffffff">"##
    );
    let _ = write!(
        svg,
        r#"<text x="56" y="92" font-size="34" font-weight="bold">{}</text>"#,
        escape_markup(&card_title(facts))
    );
    let _ = write!(
        svg,
        r##"<rect x="56" y="112" width="{}" height="2" fill="#ffffff" fill-opacity="0.25"/>"##,
        w - 112
    );

    for (i, (key, value)) in lines.iter().enumerate() {
        let y = HEADER_HEIGHT + LINE_HEIGHT * i as u32 + 10;
        let _ = write!(
            svg,
            r#"<text x="56" y="{y}" font-size="19" fill-opacity="0.75">{}</text>"#,
            escape_markup(key)
        );
        let _ = write!(
            svg,
            r#"<text x="{}" y="{y}" font-size="19" text-anchor="end">{}</text>"#,
            w - 56,
            escape_markup(&display_value(value))
        );
    }

    let _ = write!(
        svg,
        r#"<text x="{}" y="{}" font-size="14" fill-opacity="0.6" text-anchor="middle">{}</text>"#,
        w / 2,
        h - 40,
        escape_markup(&format!("Generated at {generated_at}"))
    );
    svg.push_str("</g></svg>");
    (svg, w, h)
}

/// SVG 栅格化并扁平化到黑底，编码为 JPEG
fn rasterize_to_jpeg(svg: &str, font_db: Arc<fontdb::Database>, quality: u8) -> Result<Vec<u8>, AppError> {
    let opts = UsvgOptions {
        fontdb: font_db,
        font_family: MAIN_FONT_FAMILY.to_string(),
        font_size: 16.0,
        languages: vec!["zh-CN".to_string(), "en".to_string()],
        ..Default::default()
    };
    let tree = usvg::Tree::from_data(svg.as_bytes(), &opts)
        .map_err(|e| AppError::ImageRendererError(format!("Failed to parse SVG: {e}")))?;

    let size = tree.size().to_int_size();
    let (w, h) = (size.width(), size.height());
    let mut pixmap = Pixmap::new(w, h)
        .ok_or_else(|| AppError::ImageRendererError("Failed to create pixmap".to_string()))?;
    resvg::render(&tree, Transform::identity(), &mut pixmap.as_mut());

    // JPEG 无透明通道：c' = c * a / 255
    let mut rgb = Vec::with_capacity((w as usize) * (h as usize) * 3);
    for px in pixmap.data().chunks_exact(4) {
        let a = px[3] as u16;
        rgb.push(((px[0] as u16 * a) / 255) as u8);
        rgb.push(((px[1] as u16 * a) / 255) as u8);
        rgb.push(((px[2] as u16 * a) / 255) as u8);
    }

    let mut out = Vec::new();
    let mut enc = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    enc.encode(&rgb, w, h, ColorType::Rgb8.into())
        .map_err(|e| AppError::ImageRendererError(format!("JPEG encode error: {e}")))?;
    Ok(out)
}

/// 基于 resvg 的静态卡片合成
#[derive(Debug, Clone)]
pub struct SvgCardComposer {
    fonts_dir: PathBuf,
}

impl SvgCardComposer {
    pub fn new(fonts_dir: PathBuf) -> Self {
        Self { fonts_dir }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.fonts_path())
    }
}

impl StaticComposer for SvgCardComposer {
    async fn compose(
        &self,
        facts: &StatusFacts,
        background: &BackgroundAsset,
    ) -> Result<Vec<u8>, AppError> {
        let facts = facts.clone();
        let background = background.clone();
        let fonts_dir = self.fonts_dir.clone();

        spawn_blocking(move || {
            let generated_at = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
            let (svg, _, _) = build_card_svg(&facts, &background, &generated_at);
            rasterize_to_jpeg(&svg, font_db(&fonts_dir), OUTPUT_JPEG_QUALITY)
        })
        .await
        .map_err(|e| AppError::Internal(format!("静态合成任务异常: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use serde_json::{Map, json};
    use std::io::Cursor;

    fn png_background() -> BackgroundAsset {
        let img = RgbImage::from_fn(16, 9, |x, _| image::Rgb([(x * 15) as u8, 80, 160]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        BackgroundAsset::new(buf.into_inner(), "image/png")
    }

    fn facts() -> StatusFacts {
        let mut map = Map::new();
        map.insert("cpu_percent".into(), json!(42.25));
        map.insert("hostname".into(), json!("a<b>&c"));
        map.insert("memory_stat".into(), json!({ "percent": 50, "used": 1, "total": 2 }));
        StatusFacts::new(map).with_defaults("PicBot", "qq")
    }

    #[test]
    fn svg_lists_facts_escaped_and_skips_bots() {
        let (svg, w, h) = build_card_svg(&facts(), &png_background(), "2024-01-01 00:00:00");
        assert_eq!(w, CARD_WIDTH);
        assert_eq!(h, MIN_CARD_HEIGHT.max(HEADER_HEIGHT + LINE_HEIGHT * 5 + FOOTER_HEIGHT));
        assert!(svg.contains("PicBot · 运行状态"));
        assert!(svg.contains("a&lt;b&gt;&amp;c"));
        assert!(svg.contains("42.2") || svg.contains("42.3"));
        assert!(svg.contains("data:image/jpeg;base64,"));
        assert!(!svg.contains(">bots<"));
    }

    #[test]
    fn undecodable_background_falls_back_to_solid_fill() {
        let bg = BackgroundAsset::new(&b"not an image"[..], "image");
        let (svg, _, _) = build_card_svg(&facts(), &bg, "now");
        assert!(!svg.contains("<image"));
        assert!(svg.contains("#1e1e24"));
    }

    #[test]
    fn long_values_are_truncated() {
        let long = "x".repeat(200);
        let shown = display_value(&Value::String(long));
        assert_eq!(shown.chars().count(), MAX_VALUE_CHARS);
        assert!(shown.ends_with('…'));
    }

    #[tokio::test]
    async fn compose_produces_a_jpeg_of_card_size() {
        let composer = SvgCardComposer::new(PathBuf::from("/nonexistent/fonts"));
        let jpeg = composer.compose(&facts(), &png_background()).await.expect("compose");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).expect("decode");
        assert_eq!(decoded.width(), CARD_WIDTH);
        assert!(decoded.height() >= MIN_CARD_HEIGHT);
    }

    #[tokio::test]
    async fn compose_survives_a_broken_background() {
        let composer = SvgCardComposer::new(PathBuf::from("/nonexistent/fonts"));
        let bg = BackgroundAsset::new(&b"garbage"[..], "image/jpeg");
        let jpeg = composer.compose(&StatusFacts::default(), &bg).await.expect("compose");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
