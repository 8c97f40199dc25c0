//! 第一层：宿主文转图服务
//!
//! 与 AstrBot 的 t2i 端点交互：提交一段自包含的 HTML，服务端渲染后返回图片 ID，
//! 最终产物以 URL 形式交给调用方。

use std::sync::OnceLock;

use base64::{Engine as _, engine::general_purpose::STANDARD as base64_engine};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::facts::StatusFacts;
use super::orchestrator::HostRenderer;
use crate::error::AppError;
use crate::features::background::BackgroundAsset;
use crate::http;

const DEFAULT_TEMPLATE_NAME: &str = "t2i_status.html";

// 自包含：背景以 data URI 内联，不依赖任何外部资源
const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="zh-CN">
<head>
<meta charset="utf-8">
<style>
body { margin: 0; font-family: "Noto Sans SC", "Microsoft YaHei", sans-serif; color: #fff; }
.card { width: 720px; min-height: 480px; padding: 32px; box-sizing: border-box;
  background: url("{{ background|safe }}") center / cover no-repeat; }
.panel { background: rgba(0, 0, 0, .55); border-radius: 16px; padding: 24px; }
h1 { margin: 0 0 16px; font-size: 28px; }
.row { display: flex; justify-content: space-between; padding: 6px 0;
  border-bottom: 1px solid rgba(255, 255, 255, .15); font-size: 18px; }
.key { opacity: .75; margin-right: 24px; }
.value { text-align: right; word-break: break-all; }
</style>
</head>
<body>
<div class="card"><div class="panel">
<h1>{{ title }}</h1>
{% for item in rows %}<div class="row"><span class="key">{{ item.key }}</span><span class="value">{{ item.value }}</span></div>
{% endfor %}</div></div>
</body>
</html>
"#;

static DEFAULT_ENV: OnceLock<Environment<'static>> = OnceLock::new();

fn default_env() -> &'static Environment<'static> {
    DEFAULT_ENV.get_or_init(|| {
        let mut env = Environment::new();
        if let Err(e) = env.add_template(DEFAULT_TEMPLATE_NAME, DEFAULT_TEMPLATE) {
            tracing::error!("内置文转图模板无效: {e}");
        }
        env
    })
}

/// 提交给文转图服务的渲染选项
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct T2iOptions {
    #[serde(rename = "type")]
    pub image_type: String,
    pub quality: u8,
    pub full_page: bool,
}

impl Default for T2iOptions {
    fn default() -> Self {
        Self {
            image_type: "jpeg".to_string(),
            quality: 90,
            full_page: true,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    tmpl: &'a str,
    json: bool,
    tmpldata: Value,
    options: &'a T2iOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    data: Option<GenerateData>,
}

#[derive(Deserialize)]
struct GenerateData {
    id: Option<String>,
}

/// 状态值的单行展示：字符串原样，其余类型压缩为 JSON
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

/// 生成第一层使用的默认 HTML：状态数据逐项展示，背景内联为 data URI。
pub fn build_default_html(
    facts: &StatusFacts,
    background: &BackgroundAsset,
) -> Result<String, AppError> {
    let background_uri = format!(
        "data:{};base64,{}",
        background.image_mime(),
        base64_engine.encode(background.data())
    );
    let rows: Vec<Value> = facts
        .iter()
        .map(|(k, v)| json!({ "key": k, "value": display_value(v) }))
        .collect();

    let tmpl = default_env()
        .get_template(DEFAULT_TEMPLATE_NAME)
        .map_err(|e| AppError::ImageRendererError(format!("加载文转图模板失败: {e}")))?;
    tmpl.render(context! {
        title => "运行状态",
        background => background_uri,
        rows => rows,
    })
    .map_err(|e| AppError::ImageRendererError(format!("渲染文转图模板失败: {e}")))
}

/// AstrBot 风格的文转图 HTTP 服务客户端
pub struct T2iServiceRenderer {
    endpoint: Option<String>,
    token: Option<String>,
    timeout_secs: u64,
}

impl T2iServiceRenderer {
    pub fn new(endpoint: Option<String>, token: Option<String>, timeout_secs: u64) -> Self {
        let endpoint = endpoint
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty());
        let token = token.filter(|t| !t.trim().is_empty());
        Self {
            endpoint,
            token,
            timeout_secs,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }
}

impl HostRenderer for T2iServiceRenderer {
    async fn render_html(&self, html: String, options: &T2iOptions) -> Result<String, AppError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| AppError::Validation("未配置 renderer.t2i_endpoint".to_string()))?;

        let client = http::client_for(self.timeout_secs, None)?;
        let mut req = client
            .post(format!("{endpoint}/text2img/generate"))
            .json(&GenerateRequest {
                tmpl: &html,
                json: true,
                tmpldata: json!({}),
                options,
            });
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp: GenerateResponse = req.send().await?.error_for_status()?.json().await?;
        let id = resp
            .data
            .and_then(|d| d.id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::ImageRendererError("文转图服务未返回图片 ID".to_string()))?;
        debug!("文转图完成: id={id}");
        Ok(format!("{endpoint}/text2img/{id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::HeaderMap, routing::post};
    use serde_json::Map;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    fn facts() -> StatusFacts {
        let mut map = Map::new();
        map.insert("cpu_percent".into(), json!(12.5));
        map.insert("hostname".into(), json!("<script>alert(1)</script>"));
        StatusFacts::new(map)
    }

    #[test]
    fn default_html_inlines_background_and_escapes_facts() {
        let bg = BackgroundAsset::new(&b"\xff\xd8\xffjpeg"[..], "image/jpeg");
        let html = build_default_html(&facts(), &bg).expect("html");

        assert!(html.contains("data:image/jpeg;base64,"));
        assert!(html.contains("cpu_percent"));
        assert!(html.contains("12.5"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[tokio::test]
    async fn unconfigured_endpoint_is_an_error() {
        let r = T2iServiceRenderer::new(Some("  ".into()), None, 5);
        assert!(!r.is_configured());
        let err = r
            .render_html("<p/>".into(), &T2iOptions::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn posts_template_and_returns_image_url() {
        let seen: Arc<Mutex<Option<(Value, Option<String>)>>> = Arc::default();
        let sink = seen.clone();
        let app = Router::new().route(
            "/text2img/generate",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    *sink.lock().unwrap() = Some((body, auth));
                    Json(json!({ "data": { "id": "abc123" } }))
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let endpoint = format!("http://{addr}/");
        let r = T2iServiceRenderer::new(Some(endpoint), Some("secret".into()), 5);
        let url = r
            .render_html("<p>hi</p>".into(), &T2iOptions::default())
            .await
            .expect("render");

        assert_eq!(url, format!("http://{addr}/text2img/abc123"));
        let (body, auth) = seen.lock().unwrap().clone().expect("request seen");
        assert_eq!(body["tmpl"], "<p>hi</p>");
        assert_eq!(body["json"], true);
        assert_eq!(body["options"]["type"], "jpeg");
        assert_eq!(body["options"]["quality"], 90);
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
    }

    #[tokio::test]
    async fn missing_image_id_is_an_error() {
        let app = Router::new().route(
            "/text2img/generate",
            post(|| async { Json(json!({ "data": {} })) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let r = T2iServiceRenderer::new(Some(format!("http://{addr}")), None, 5);
        let err = r
            .render_html("<p/>".into(), &T2iOptions::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, AppError::ImageRendererError(_)));
    }
}
