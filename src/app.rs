use axum::{Router, routing::get};
use tower_http::compression::CompressionLayer;

use crate::features::health::health_check;
use crate::features::status::create_status_router;
use crate::state::AppState;

pub(crate) fn compression_predicate() -> impl tower_http::compression::predicate::Predicate {
    use tower_http::compression::predicate::{NotForContentType, Predicate, SizeAbove};

    // 只压缩 JSON/文本类响应；状态图本身就是 JPEG，再压缩只会浪费 CPU
    SizeAbove::default()
        .and(NotForContentType::GRPC)
        .and(NotForContentType::IMAGES)
        .and(NotForContentType::SSE)
        .and(NotForContentType::const_new("application/octet-stream"))
}

/// 组装完整的 HTTP 路由
pub fn create_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/health", get(health_check))
        .merge(create_status_router())
        .with_state(state)
        .layer(CompressionLayer::new().compress_when(compression_predicate()))
}

#[cfg(test)]
mod compression_predicate_tests {
    use super::compression_predicate;
    use axum::body::Body;
    use axum::http::{Response as HttpResponse, header};
    use tower_http::compression::predicate::Predicate;

    fn should_compress_for(ct: &str) -> bool {
        // 命中 SizeAbove（默认 32B），避免因为 body 太小导致测试不稳定。
        let body_bytes = vec![b'x'; 2048];
        let resp = HttpResponse::builder()
            .header(header::CONTENT_TYPE, ct)
            .body(Body::from(body_bytes))
            .unwrap();
        compression_predicate().should_compress(&resp)
    }

    #[test]
    fn rendered_images_are_not_recompressed() {
        assert!(!should_compress_for("image/jpeg"));
        assert!(!should_compress_for("image/webp"));
    }

    #[test]
    fn problem_json_is_compressed() {
        assert!(should_compress_for("application/problem+json"));
        assert!(should_compress_for("application/json"));
    }
}
