use std::{collections::BTreeMap, time::Duration};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{LlmError, LlmResult};

/** \brief 中继在自身产生的错误响应上附加的标记头。 */
pub const RELAY_MARKER_HEADER: &str = "x-nexus-relay";
pub const RELAY_MARKER_ERROR: &str = "error";

/** \brief 中继自身会返回的错误状态码。 */
const RELAY_ERROR_STATUSES: [u16; 3] = [400, 403, 500];

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/**
 * \brief 中继请求信封：`{url, method, headers, body}`。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/**
 * \brief 与 Provider 无关的出站请求。
 * \details body 为字符串时原样发送（例如表单），其他 JSON 值会被序列化。
 */
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /**
     * \brief 有 body 且未指定 content-type 时补上 application/json。
     */
    pub fn with_default_content_type(mut self) -> Self {
        let has_content_type = self
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));
        if self.body.is_some() && !has_content_type {
            self.headers
                .insert("Content-Type".to_string(), "application/json".to_string());
        }
        self
    }

    pub fn to_envelope(&self) -> RelayEnvelope {
        RelayEnvelope {
            url: self.url.clone(),
            method: self.method.as_str().to_string(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/** \brief 把 JSON body 转为线上字节：字符串原样，其他序列化。 */
pub fn body_to_text(body: &Value) -> String {
    match body {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/**
 * \brief 中继客户端：直连 Provider，或把请求包成信封交给同源中继转发。
 */
#[derive(Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl RelayClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /**
     * \brief 发送请求。`relay_url` 为 None 时直连，否则经由中继。
     * \details 取消令牌触发时立即中止，返回 Cancelled，不影响任何状态。
     */
    pub async fn request(
        &self,
        request: HttpRequest,
        relay_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> LlmResult<HttpResponse> {
        let request = request.with_default_content_type();
        let call = async {
            match relay_url {
                None => self.send_direct(&request).await,
                Some(relay) => self.send_via_relay(&request, relay).await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = call => result,
        }
    }

    async fn send_direct(&self, request: &HttpRequest) -> LlmResult<HttpResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        builder = builder
            .headers(to_header_map(&request.headers))
            .timeout(self.timeout);
        if let Some(body) = &request.body {
            builder = builder.body(body_to_text(body));
        }
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout)
            } else {
                LlmError::Network(e.to_string())
            }
        })?;
        read_response(resp)
            .await
            .map_err(|e| self.map_body_error(e, LlmError::Network))
    }

    async fn send_via_relay(&self, request: &HttpRequest, relay_url: &str) -> LlmResult<HttpResponse> {
        let unavailable = |reason: String| LlmError::RelayUnavailable {
            relay_url: relay_url.to_string(),
            reason,
        };
        let resp = self
            .client
            .post(relay_url)
            .json(&request.to_envelope())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout)
                } else {
                    unavailable(e.to_string())
                }
            })?;

        let marked_error = resp
            .headers()
            .get(RELAY_MARKER_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == RELAY_MARKER_ERROR);
        let response = read_response(resp)
            .await
            .map_err(|e| self.map_body_error(e, unavailable))?;

        match relay_error_message(&response, marked_error) {
            None => Ok(response),
            Some(reason) => {
                tracing::warn!(status = response.status, "relay rejected request: {}", reason);
                Err(unavailable(format!("HTTP {}: {}", response.status, reason)))
            }
        }
    }

    fn map_body_error(&self, err: reqwest::Error, other: impl FnOnce(String) -> LlmError) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(self.timeout)
        } else {
            other(err.to_string())
        }
    }
}

/**
 * \brief 判断中继响应是否为中继自身的错误，是则返回错误描述。
 * \details 2xx 一律视为透传。没有标记头的中继只能靠 400/403/500 加
 * `{"error": "<字符串>"}` 识别；上游的错误体（如 OpenAI 的 error 对象）不会误判。
 */
fn relay_error_message(response: &HttpResponse, marked_error: bool) -> Option<String> {
    if response.is_success() {
        return None;
    }
    let message = response
        .json()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string));
    if marked_error {
        return Some(message.unwrap_or_else(|| {
            if response.body.is_empty() {
                "empty response from relay".to_string()
            } else {
                response.body.chars().take(200).collect()
            }
        }));
    }
    message.filter(|_| RELAY_ERROR_STATUSES.contains(&response.status))
}

async fn read_response(resp: reqwest::Response) -> Result<HttpResponse, reqwest::Error> {
    let status = resp.status().as_u16();
    let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let body = resp.text().await?;
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

fn to_header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::debug!(header = %name, "skipping invalid header"),
        }
    }
    map
}
