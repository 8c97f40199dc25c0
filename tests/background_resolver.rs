use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use tempfile::TempDir;

use picstatus_backend::{
    AppError,
    config::BackgroundConfig,
    features::background::{BackgroundProvider, BackgroundResolver},
};

const DEFAULT_BG: &[u8] = b"RIFF\x1a\x00\x00\x00WEBPdefault";

fn default_asset(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("default_bg.webp");
    std::fs::write(&path, DEFAULT_BG).expect("write default asset");
    path
}

fn config(preload_count: usize, timeout_secs: u64) -> BackgroundConfig {
    BackgroundConfig {
        bg_preload_count: preload_count,
        bg_req_timeout: timeout_secs,
        ..BackgroundConfig::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn caller_bytes_win_and_leave_the_cache_untouched() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));

    let asset = resolver
        .resolve(
            Some(Bytes::from_static(b"caller-image")),
            "loli",
            None,
            &config(1, 10),
        )
        .await
        .expect("resolve");

    assert_eq!(&asset.data()[..], b"caller-image");
    assert_eq!(asset.mime(), "image");
    assert!(resolver.cached().is_none());
}

#[tokio::test]
async fn empty_caller_bytes_fall_through_to_the_provider() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));

    let asset = resolver
        .resolve(Some(Bytes::new()), "none", None, &config(1, 10))
        .await
        .expect("resolve");
    assert_eq!(&asset.data()[..], DEFAULT_BG);
}

#[tokio::test]
async fn provider_none_serves_the_default_asset() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));

    let asset = resolver
        .resolve(None, "NONE", None, &config(1, 10))
        .await
        .expect("resolve");
    assert_eq!(&asset.data()[..], DEFAULT_BG);
    assert_eq!(asset.mime(), "image/webp");

    let cached = resolver.cached().expect("preloader cached");
    assert_eq!(cached.source().config().provider, BackgroundProvider::None);
}

#[tokio::test]
async fn identical_config_reuses_the_preloader() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));
    let cfg = config(1, 10);

    resolver.resolve(None, "none", None, &cfg).await.unwrap();
    let first = resolver.cached().expect("cached");
    resolver.resolve(None, "none", None, &cfg).await.unwrap();
    let second = resolver.cached().expect("cached");

    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn any_config_change_replaces_the_preloader() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));

    resolver.resolve(None, "none", None, &config(1, 10)).await.unwrap();
    let before = resolver.cached().expect("cached");

    resolver.resolve(None, "none", None, &config(1, 11)).await.unwrap();
    let after = resolver.cached().expect("cached");

    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.source().config().timeout_secs, 11);
}

#[tokio::test]
async fn unknown_provider_names_share_the_local_preloader() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));
    let cfg = config(1, 10);

    resolver.resolve(None, "local", None, &cfg).await.unwrap();
    let local = resolver.cached().expect("cached");
    resolver.resolve(None, "something-else", None, &cfg).await.unwrap();
    let unknown = resolver.cached().expect("cached");

    assert!(Arc::ptr_eq(&local, &unknown));
}

fn local_gallery(dir: &TempDir) -> (PathBuf, Vec<Vec<u8>>) {
    let gallery = dir.path().join("gallery");
    std::fs::create_dir_all(&gallery).unwrap();
    let mut contents = Vec::new();
    for (i, name) in ["a.jpg", "b.png", "c.webp"].iter().enumerate() {
        let bytes = format!("image-{i}").into_bytes();
        std::fs::write(gallery.join(name), &bytes).unwrap();
        contents.push(bytes);
    }
    (gallery, contents)
}

#[tokio::test]
async fn local_directory_is_preloaded_up_to_depth() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));
    let (gallery, contents) = local_gallery(&dir);
    let cfg = config(2, 10);

    let first = resolver
        .resolve(None, "local", Some(gallery.as_path()), &cfg)
        .await
        .expect("resolve");
    assert!(contents.iter().any(|c| c[..] == first.data()[..]));

    let preloader = resolver.cached().expect("cached");
    assert_eq!(preloader.depth(), 2);
    assert!(wait_until(|| preloader.queued() == 2).await);
    assert!(wait_until(|| !preloader.is_filling()).await);

    // 命中队列；之后队列不会超过深度
    let second = resolver
        .resolve(None, "local", Some(gallery.as_path()), &cfg)
        .await
        .expect("resolve");
    assert!(contents.iter().any(|c| c[..] == second.data()[..]));
    assert!(preloader.queued() <= 2);
}

#[tokio::test]
async fn empty_local_directory_yields_the_default_asset() {
    let dir = TempDir::new().unwrap();
    let resolver = BackgroundResolver::new(default_asset(&dir));
    let empty = dir.path().join("empty");
    std::fs::create_dir_all(&empty).unwrap();

    let asset = resolver
        .resolve(None, "local", Some(empty.as_path()), &config(1, 10))
        .await
        .expect("resolve");
    assert_eq!(&asset.data()[..], DEFAULT_BG);
}

#[tokio::test]
async fn missing_default_asset_is_a_fatal_error() {
    let resolver = BackgroundResolver::new(Path::new("/definitely/not/here.webp").to_path_buf());

    let err = resolver
        .resolve(None, "none", None, &config(1, 10))
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::DefaultAssetMissing(_)));
}
