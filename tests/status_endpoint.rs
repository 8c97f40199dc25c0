use std::io::Cursor;
use std::path::PathBuf;

use axum::{
    Json, Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    routing::post,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

use picstatus_backend::{AppConfig, AppState, create_app};

const RENDER_TIER: &str = "x-render-tier";

fn resources_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("resources")
}

fn write_png(path: &std::path::Path) {
    let img = image::RgbImage::from_pixel(64, 36, image::Rgb([40, 90, 160]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .expect("encode png");
    std::fs::write(path, buf.into_inner()).expect("write png");
}

/// 关闭状态的本地端口：先占用再释放
async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn test_config(dir: &TempDir) -> AppConfig {
    let default_bg = dir.path().join("default_bg.png");
    write_png(&default_bg);

    let mut config = AppConfig::default();
    config.resources.base_path = resources_dir().to_string_lossy().into_owned();
    config.resources.cache_dir = dir.path().to_string_lossy().into_owned();
    config.background.provider = "none".to_string();
    config.background.default_asset = default_bg.to_string_lossy().into_owned();
    config.renderer.browser_timeout_secs = 3;
    config
}

fn status_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/status/image")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn sample_facts() -> Value {
    json!({
        "hostname": "node-1",
        "cpu_percent": 23.5,
        "memory_percent": 61.0,
        "bots": [{ "nick": "Alice", "platform": "qq" }]
    })
}

#[tokio::test]
async fn health_reports_service_identity() {
    let dir = TempDir::new().unwrap();
    let app = create_app(AppState::from_config(test_config(&dir)));

    let resp = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["status"], "healthy");
    assert_eq!(v["service"], env!("CARGO_PKG_NAME"));
}

#[tokio::test]
async fn pillow_mode_returns_static_jpeg_and_caches_it() {
    let dir = TempDir::new().unwrap();
    let app = create_app(AppState::from_config(test_config(&dir)));

    let resp = app
        .oneshot(status_request(json!({
            "facts": sample_facts(),
            "renderer": "pillow",
        })))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/jpeg");
    assert_eq!(resp.headers()[RENDER_TIER], "static");

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..2], &[0xFF, 0xD8]);

    let cached = std::fs::read(dir.path().join("status.jpg")).expect("cached image");
    assert_eq!(cached, body.to_vec());
}

#[tokio::test]
async fn caller_base64_background_is_accepted() {
    let dir = TempDir::new().unwrap();
    let app = create_app(AppState::from_config(test_config(&dir)));

    let png_path = dir.path().join("caller.png");
    write_png(&png_path);
    let encoded = {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(std::fs::read(&png_path).unwrap())
    };

    let resp = app
        .oneshot(status_request(json!({
            "facts": sample_facts(),
            "renderer": "pillow",
            "background_base64": format!("base64://{encoded}"),
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[RENDER_TIER], "static");
}

#[tokio::test]
async fn auto_mode_falls_back_to_static_when_upper_tiers_are_unavailable() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.renderer.t2i_endpoint = None;
    config.renderer.cdp_url = Some(closed_port_url().await);
    let app = create_app(AppState::from_config(config));

    let resp = app
        .oneshot(status_request(json!({
            "facts": sample_facts(),
            "renderer": "auto",
        })))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[RENDER_TIER], "static");
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
}

#[tokio::test]
async fn html_strict_failure_is_a_problem_response() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.renderer.cdp_url = Some(closed_port_url().await);
    let app = create_app(AppState::from_config(config));

    let resp = app
        .oneshot(status_request(json!({
            "facts": sample_facts(),
            "renderer": "html_strict",
        })))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "application/problem+json"
    );

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["code"], "STATUS_RENDER_FAILED");
    assert_eq!(v["failedTiers"], json!(["html"]));
    assert!(v["detail"].as_str().unwrap_or_default().contains("Chromium"));
    assert!(!dir.path().join("status.jpg").exists());
}

#[tokio::test]
async fn host_tier_success_redirects_to_the_hosted_image() {
    let t2i = Router::new().route(
        "/text2img/generate",
        post(|Json(_body): Json<Value>| async move { Json(json!({ "data": { "id": "abc" } })) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, t2i).await.unwrap();
    });

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.renderer.t2i_endpoint = Some(format!("http://{addr}"));
    let app = create_app(AppState::from_config(config));

    let resp = app
        .oneshot(status_request(json!({
            "facts": sample_facts(),
            "renderer": "astr_t2i",
        })))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        resp.headers()[header::LOCATION],
        format!("http://{addr}/text2img/abc").as_str()
    );
    assert_eq!(resp.headers()[RENDER_TIER], "t2i");
}

#[tokio::test]
async fn missing_default_background_is_reported() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.background.default_asset = dir
        .path()
        .join("gone.webp")
        .to_string_lossy()
        .into_owned();
    let app = create_app(AppState::from_config(config));

    let resp = app
        .oneshot(status_request(json!({ "renderer": "pillow" })))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["code"], "DEFAULT_BACKGROUND_MISSING");
}

#[tokio::test]
async fn request_local_path_outside_configured_root_is_rejected() {
    let dir = TempDir::new().unwrap();
    let gallery = dir.path().join("gallery");
    std::fs::create_dir_all(&gallery).unwrap();
    write_png(&gallery.join("bg.png"));

    let mut config = test_config(&dir);
    config.background.provider = "local".to_string();
    config.background.local_path = Some(gallery.to_string_lossy().into_owned());
    let state = AppState::from_config(config);

    for escape in ["../default_bg.png", "/etc"] {
        let resp = create_app(state.clone())
            .oneshot(status_request(json!({
                "renderer": "pillow",
                "provider": "local",
                "local_path": escape,
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY, "{escape}");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["code"], "VALIDATION_FAILED");
    }

    let resp = create_app(state)
        .oneshot(status_request(json!({
            "renderer": "pillow",
            "local_path": "bg.png",
        })))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
