use std::fs;
use std::path::Path;

use crate::config::AppConfig;
use crate::error::AppError;

/// 执行启动检查
///
/// 1. 检查并创建渲染产物缓存目录
/// 2. 校验内置默认背景（缺失直接终止启动）
/// 3. 检查浏览器渲染层资源（仅告警，该层会在运行时失败并回退）
pub async fn run_startup_checks(config: &AppConfig) -> Result<(), AppError> {
    tracing::info!("🔍 开始执行启动检查...");

    ensure_cache_dir(&config.cache_path())?;
    ensure_default_background(&config.background.default_asset_path())?;
    check_page_resources(config);

    tracing::info!("✅ 启动检查完成");
    Ok(())
}

/// 确保缓存目录存在
fn ensure_cache_dir(path: &Path) -> Result<(), AppError> {
    if path.is_dir() {
        tracing::info!("✅ 缓存目录已存在: {:?}", path);
        return Ok(());
    }
    tracing::warn!("📁 未找到缓存目录，正在创建: {:?}", path);
    fs::create_dir_all(path)
        .map_err(|e| AppError::Internal(format!("创建缓存目录失败: {e}")))?;
    Ok(())
}

/// 内置默认背景是所有来源的最终兜底，缺失属于部署损坏
fn ensure_default_background(path: &Path) -> Result<(), AppError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {
            tracing::info!("✅ 默认背景存在: {:?}", path);
            Ok(())
        }
        _ => {
            tracing::error!("❌ 默认背景缺失或为空: {:?}", path);
            Err(AppError::DefaultAssetMissing(path.to_path_buf()))
        }
    }
}

fn check_page_resources(config: &AppConfig) {
    let index = config
        .template_res_path()
        .join("templates")
        .join(crate::features::status::INDEX_TEMPLATE);
    for (what, path) in [
        ("页面模板", index),
        ("页面脚本目录", config.js_path()),
        ("机器人头像", config.avatar_path()),
    ] {
        if path.exists() {
            tracing::info!("{what}存在: {:?}", path);
        } else {
            tracing::warn!("⚠️ 未找到{what}: {:?}，浏览器渲染层将不可用", path);
        }
    }
    if !config.fonts_path().is_dir() {
        tracing::warn!("未找到字体目录 {:?}，静态合成仅使用系统字体", config.fonts_path());
    }
}
