use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use url::{Origin, Url};

use crate::relay::{body_to_text, RelayEnvelope, RELAY_MARKER_ERROR, RELAY_MARKER_HEADER};

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/** \brief 默认允许转发的上游 Origin。 */
pub const DEFAULT_ALLOWLIST: [&str; 9] = [
    "https://api.openai.com",
    "https://api.anthropic.com",
    "https://iam.cloud.ibm.com",
    "https://us-south.ml.cloud.ibm.com",
    "https://eu-de.ml.cloud.ibm.com",
    "https://eu-gb.ml.cloud.ibm.com",
    "https://jp-tok.ml.cloud.ibm.com",
    "https://au-syd.ml.cloud.ibm.com",
    "https://ca-tor.ml.cloud.ibm.com",
];

const MISSING_URL: &str = "Missing \"url\" in request body.";
const HTTPS_ONLY: &str = "Only https:// URLs are allowed.";
const NOT_ALLOWED: &str = "Target URL not in allowlist.";

/** \brief 不向上游转发的逐跳头。 */
const HOP_BY_HOP: [&str; 3] = ["host", "content-length", "connection"];
/** \brief 回传给调用方的上游响应头。 */
const FORWARDED_RESPONSE_HEADERS: [&str; 2] = ["content-type", "x-ratelimit-remaining"];

/**
 * \brief 中继进程配置。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /** \brief 允许跨域调用本中继的页面 Origin，空表示不限制 */
    pub allowed_origins: Vec<String>,
    /** \brief 允许转发的上游 Origin */
    pub allowlist: Vec<String>,
    pub upstream_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
            allowlist: DEFAULT_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }
}

impl RelayConfig {
    /**
     * \brief 从环境变量读取配置，缺失或无法解析的值使用默认值。
     */
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let port = lookup("NEXUS_PROXY_PORT")
            .or_else(|| lookup("PORT"))
            .and_then(|p| p.trim().parse().ok())
            .unwrap_or(defaults.port);
        let host = lookup("NEXUS_PROXY_HOST")
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or(defaults.host);
        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        let allowlist = lookup("NEXUS_PROXY_ALLOWLIST")
            .map(|raw| split_list(&raw))
            .filter(|list| !list.is_empty())
            .unwrap_or(defaults.allowlist);
        let upstream_timeout = lookup("NEXUS_PROXY_TIMEOUT_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.upstream_timeout);
        Self {
            host,
            port,
            allowed_origins,
            allowlist,
            upstream_timeout,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Clone)]
struct RelayState {
    client: reqwest::Client,
    allowlist: Arc<Vec<Origin>>,
    timeout: Duration,
}

/**
 * \brief 构建中继路由：`POST /proxy` 与 `GET /health`。
 */
pub fn router(config: &RelayConfig) -> Router {
    let allowlist = config
        .allowlist
        .iter()
        .filter_map(|entry| match Url::parse(entry) {
            Ok(u) => Some(u.origin()),
            Err(e) => {
                tracing::warn!(entry = %entry, error = %e, "ignoring invalid allowlist entry");
                None
            }
        })
        .collect();
    let state = RelayState {
        client: reqwest::Client::new(),
        allowlist: Arc::new(allowlist),
        timeout: config.upstream_timeout,
    };

    Router::new()
        .route("/proxy", post(proxy))
        .route("/health", get(health_check))
        .layer(cors_layer(&config.allowed_origins))
        .with_state(state)
}

/**
 * \brief 启动中继服务，直到 shutdown 被触发。
 */
pub async fn run(config: RelayConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = config.addr();
    let app = router(&config);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind relay on {}", addr))?;
    tracing::info!(
        allowlist = config.allowlist.len(),
        cors_restricted = !config.allowed_origins.is_empty(),
        "CORS relay listening on http://{}/proxy",
        addr
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("relay server failed")?;
    tracing::info!("CORS relay stopped");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let values: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(values))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/**
 * \brief 中继入口：校验目标地址后转发，上游响应原样回传。
 */
async fn proxy(State(state): State<RelayState>, body: Bytes) -> Response {
    let envelope = match parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(message) => return relay_error(StatusCode::BAD_REQUEST, message),
    };
    let target = match validate_target(&envelope.url, &state.allowlist) {
        Ok(target) => target,
        Err((status, message)) => {
            tracing::warn!(status = status.as_u16(), "relay request rejected: {}", message);
            return relay_error(status, message);
        }
    };
    let method = match Method::from_bytes(envelope.method.trim().to_ascii_uppercase().as_bytes()) {
        Ok(m) => m,
        Err(_) => return relay_error(StatusCode::BAD_REQUEST, "Unsupported HTTP method."),
    };

    let origin = target.origin().ascii_serialization();
    match forward_upstream(&state.client, state.timeout, method.clone(), target, &envelope).await {
        Ok(resp) => {
            tracing::info!(method = %method, origin = %origin, status = resp.status().as_u16(), "relayed");
            resp
        }
        Err(message) => {
            tracing::warn!(method = %method, origin = %origin, "upstream request failed: {}", message);
            relay_error(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}

/**
 * \brief 解析信封。非 JSON 或没有字符串 url 时报缺少 url，其余字段不合法时给出具体原因。
 */
fn parse_envelope(body: &[u8]) -> Result<RelayEnvelope, String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| MISSING_URL.to_string())?;
    if !value.get("url").is_some_and(|u| u.is_string()) {
        return Err(MISSING_URL.to_string());
    }
    serde_json::from_value(value).map_err(|e| format!("Invalid relay request: {}", e))
}

/**
 * \brief 校验转发目标：必须是 https，且 Origin 精确命中白名单。
 */
fn validate_target(raw: &str, allowlist: &[Origin]) -> Result<Url, (StatusCode, &'static str)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err((StatusCode::BAD_REQUEST, MISSING_URL));
    }
    let url = Url::parse(raw).map_err(|_| (StatusCode::BAD_REQUEST, HTTPS_ONLY))?;
    if url.scheme() != "https" {
        return Err((StatusCode::BAD_REQUEST, HTTPS_ONLY));
    }
    if !allowlist.contains(&url.origin()) {
        return Err((StatusCode::FORBIDDEN, NOT_ALLOWED));
    }
    Ok(url)
}

async fn forward_upstream(
    client: &reqwest::Client,
    timeout: Duration,
    method: Method,
    target: Url,
    envelope: &RelayEnvelope,
) -> Result<Response, String> {
    let mut headers = HeaderMap::new();
    for (name, value) in &envelope.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }

    let sends_body = method != Method::GET && method != Method::HEAD;
    let mut builder = client
        .request(method, target)
        .headers(headers)
        .timeout(timeout);
    if let Some(body) = envelope.body.as_ref().filter(|_| sends_body) {
        builder = builder.body(body_to_text(body));
    }
    let upstream = builder.send().await.map_err(|e| e.to_string())?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for name in FORWARDED_RESPONSE_HEADERS {
        if let Some(value) = upstream.headers().get(name) {
            response_headers.insert(HeaderName::from_static(name), value.clone());
        }
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn relay_error(status: StatusCode, message: impl Into<String>) -> Response {
    let mut response = (status, Json(json!({"error": message.into()}))).into_response();
    response.headers_mut().insert(
        HeaderName::from_static(RELAY_MARKER_HEADER),
        HeaderValue::from_static(RELAY_MARKER_ERROR),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::to_bytes,
        http::{header, Request},
    };
    use std::collections::BTreeMap;
    use tower::ServiceExt;
    use wiremock::matchers::{body_string, header as header_is, method as method_is, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY_LIMIT: usize = 1_048_576;

    fn default_origins() -> Vec<Origin> {
        DEFAULT_ALLOWLIST
            .iter()
            .map(|s| Url::parse(s).unwrap().origin())
            .collect()
    }

    fn post_proxy(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/proxy")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("build request")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), BODY_LIMIT)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("parse json")
    }

    fn content_type_of(headers: &HeaderMap) -> Option<&str> {
        headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    fn marker(response: &Response) -> Option<&str> {
        response
            .headers()
            .get(RELAY_MARKER_HEADER)
            .and_then(|v| v.to_str().ok())
    }

    #[test]
    fn test_config_from_lookup() {
        let env: BTreeMap<&str, &str> = [
            ("PORT", "8080"),
            ("ALLOWED_ORIGINS", "http://localhost:5173, https://app.example.com/"),
            ("NEXUS_PROXY_TIMEOUT_SECS", "15"),
        ]
        .into_iter()
        .collect();
        let config = RelayConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.port, 8080);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(
            config.allowed_origins,
            vec!["http://localhost:5173", "https://app.example.com"]
        );
        assert_eq!(config.allowlist.len(), DEFAULT_ALLOWLIST.len());
        assert_eq!(config.upstream_timeout, Duration::from_secs(15));

        let config = RelayConfig::from_lookup(|k| match k {
            "NEXUS_PROXY_PORT" => Some("4000".into()),
            "PORT" => Some("8080".into()),
            "NEXUS_PROXY_TIMEOUT_SECS" => Some("soon".into()),
            _ => None,
        });
        assert_eq!(config.port, 4000);
        assert_eq!(config.upstream_timeout, DEFAULT_UPSTREAM_TIMEOUT);
        assert_eq!(config.addr(), "127.0.0.1:4000");
    }

    #[test]
    fn test_validate_target_rules() {
        let allow = default_origins();
        assert!(validate_target("https://api.openai.com/v1/chat/completions", &allow).is_ok());
        assert!(validate_target("https://api.anthropic.com:443/v1/messages", &allow).is_ok());
        assert_eq!(validate_target("  ", &allow).unwrap_err().1, MISSING_URL);
        assert_eq!(
            validate_target("http://api.openai.com/v1", &allow).unwrap_err(),
            (StatusCode::BAD_REQUEST, HTTPS_ONLY)
        );
        for attack in [
            "https://api.openai.com.evil.test/v1",
            "https://api.openai.com@evil.test/v1",
            "https://evil.test/https://api.openai.com",
            "https://api.openai.com:8443/v1",
        ] {
            assert_eq!(
                validate_target(attack, &allow).unwrap_err(),
                (StatusCode::FORBIDDEN, NOT_ALLOWED),
                "{attack}"
            );
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(&RelayConfig::default());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("build request");
        let response = app.oneshot(request).await.expect("router call");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_proxy_rejections_carry_error_marker() {
        let cases = [
            (json!({"method": "GET"}).to_string(), StatusCode::BAD_REQUEST, MISSING_URL),
            ("not json".to_string(), StatusCode::BAD_REQUEST, MISSING_URL),
            (
                json!({"url": "http://api.openai.com/v1/models"}).to_string(),
                StatusCode::BAD_REQUEST,
                HTTPS_ONLY,
            ),
            (
                json!({"url": "https://api.openai.com.evil.test/v1/models"}).to_string(),
                StatusCode::FORBIDDEN,
                NOT_ALLOWED,
            ),
            (
                json!({
                    "url": "https://evil.test/v1/chat/completions",
                    "method": "POST",
                    "headers": {"Authorization": "Bearer sk-x", "Content-Type": "application/json"},
                    "body": {"model": "gpt-4o"}
                })
                .to_string(),
                StatusCode::FORBIDDEN,
                NOT_ALLOWED,
            ),
            (
                json!({
                    "url": "https://evil.test/",
                    "method": "BREW",
                    "headers": {"Authorization": "Bearer sk-x"}
                })
                .to_string(),
                StatusCode::FORBIDDEN,
                NOT_ALLOWED,
            ),
            (
                json!({"url": "https://api.openai.com:8443/v1/models", "method": "DELETE"}).to_string(),
                StatusCode::FORBIDDEN,
                NOT_ALLOWED,
            ),
        ];
        for (body, status, message) in cases {
            let app = router(&RelayConfig::default());
            let response = app.oneshot(post_proxy(body)).await.expect("router call");
            assert_eq!(response.status(), status);
            assert_eq!(marker(&response), Some(RELAY_MARKER_ERROR));
            assert_eq!(json_body(response).await, json!({"error": message}));
        }
    }

    #[tokio::test]
    async fn test_malformed_envelope_gets_specific_400() {
        let body = json!({
            "url": "https://api.openai.com/v1/models",
            "headers": {"x-retries": 3}
        })
        .to_string();
        let response = router(&RelayConfig::default())
            .oneshot(post_proxy(body))
            .await
            .expect("router call");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(marker(&response), Some(RELAY_MARKER_ERROR));
        let v = json_body(response).await;
        let message = v["error"].as_str().unwrap_or_default();
        assert!(message.starts_with("Invalid relay request:"), "{message}");
    }

    #[tokio::test]
    async fn test_upstream_transport_failure_is_500() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = RelayConfig {
            allowlist: vec![format!("https://{}", addr)],
            ..RelayConfig::default()
        };
        let body = json!({"url": format!("https://{}/v1/models", addr)}).to_string();
        let response = router(&config)
            .oneshot(post_proxy(body))
            .await
            .expect("router call");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(marker(&response), Some(RELAY_MARKER_ERROR));
        let v = json_body(response).await;
        assert!(v["error"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[tokio::test]
    async fn test_forward_passes_status_body_and_selected_headers() {
        let server = MockServer::start().await;
        Mock::given(method_is("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_is("authorization", "Bearer sk-x"))
            .and(body_string("{\"model\":\"gpt-4o\"}"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("content-type", "application/json")
                    .insert_header("x-ratelimit-remaining", "0")
                    .insert_header("x-request-id", "req-1")
                    .set_body_string("{\"error\":\"rate limited\"}"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer sk-x".to_string());
        headers.insert("Host".to_string(), "api.openai.com".to_string());
        headers.insert("Content-Length".to_string(), "999".to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        let envelope = RelayEnvelope {
            url: format!("{}/v1/chat/completions", server.uri()),
            method: "POST".to_string(),
            headers,
            body: Some(json!({"model": "gpt-4o"})),
        };
        let target = Url::parse(&envelope.url).unwrap();
        let response = forward_upstream(
            &reqwest::Client::new(),
            Duration::from_secs(5),
            Method::POST,
            target,
            &envelope,
        )
        .await
        .expect("forwarded");

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(marker(&response), None);
        assert_eq!(content_type_of(response.headers()), Some("application/json"));
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").and_then(|v| v.to_str().ok()),
            Some("0")
        );
        assert!(response.headers().get("x-request-id").is_none());
        assert_eq!(json_body(response).await, json!({"error": "rate limited"}));

        let received = server.received_requests().await.expect("recording enabled");
        let host = received[0].headers.get("host").and_then(|v| v.to_str().ok());
        assert_ne!(host, Some("api.openai.com"));
    }

    #[tokio::test]
    async fn test_cors_permissive_and_restricted() {
        let preflight = |origin: &str| {
            Request::builder()
                .method("OPTIONS")
                .uri("/proxy")
                .header(header::ORIGIN, origin)
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .expect("build request")
        };

        let open = router(&RelayConfig::default())
            .oneshot(preflight("http://anywhere.test"))
            .await
            .expect("router call");
        assert!(open.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_some());

        let config = RelayConfig {
            allowed_origins: vec!["http://localhost:5173".to_string()],
            ..RelayConfig::default()
        };
        let allowed = router(&config)
            .oneshot(preflight("http://localhost:5173"))
            .await
            .expect("router call");
        assert_eq!(
            allowed
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok()),
            Some("http://localhost:5173")
        );

        let denied = router(&config)
            .oneshot(preflight("http://evil.test"))
            .await
            .expect("router call");
        assert!(denied.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
