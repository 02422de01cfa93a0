use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::credentials::looks_like_jwt;
use crate::error::{LlmError, LlmResult};
use crate::relay::{HttpRequest, RelayClient};

pub const IBM_IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";
const IAM_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";

/** \brief 令牌到期前提前失效的安全余量。 */
pub const SAFETY_MARGIN_MS: i64 = 60_000;

/** \brief 毫秒时钟，测试中可替换。 */
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    })
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at_ms: i64,
    credential_fingerprint: u64,
}

#[derive(Debug, Deserialize)]
struct IamTokenResponse {
    access_token: String,
    /** \brief 有效期（秒） */
    expires_in: i64,
}

/**
 * \brief IAM 令牌交换器：用长期 API Key 换取短期 Bearer Token，并在进程内缓存。
 */
pub struct TokenExchanger {
    endpoint: String,
    cache: Mutex<Option<CachedToken>>,
    clock: Clock,
}

impl Default for TokenExchanger {
    fn default() -> Self {
        Self::new(IBM_IAM_TOKEN_URL)
    }
}

impl TokenExchanger {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_clock(endpoint, system_clock())
    }

    pub fn with_clock(endpoint: impl Into<String>, clock: Clock) -> Self {
        Self {
            endpoint: endpoint.into(),
            cache: Mutex::new(None),
            clock,
        }
    }

    /**
     * \brief 返回可用的 Bearer Token。
     * \details JWT 形状的凭据直接透传且不缓存；缓存命中且未过期则复用；否则发起一次交换。
     *          交换失败时缓存保持原状，错误原样上抛。
     */
    pub async fn get_bearer(
        &self,
        credential: &str,
        http: &RelayClient,
        relay_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> LlmResult<String> {
        let credential = credential.trim();
        if looks_like_jwt(credential) {
            return Ok(credential.to_string());
        }

        let fingerprint = fingerprint(credential);
        // 锁覆盖整个交换过程，并发调用只会触发一次交换
        let mut guard = self.cache.lock().await;
        let now = (self.clock)();
        if let Some(cached) = guard.as_ref() {
            if cached.credential_fingerprint == fingerprint
                && now < cached.expires_at_ms.saturating_sub(SAFETY_MARGIN_MS)
            {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.exchange(credential, http, relay_url, cancel).await?;
        let token = fresh.access_token.clone();
        *guard = Some(CachedToken {
            token: fresh.access_token,
            expires_at_ms: (self.clock)().saturating_add(fresh.expires_in.saturating_mul(1000)),
            credential_fingerprint: fingerprint,
        });
        tracing::debug!(expires_in = fresh.expires_in, "cached new IAM token");
        Ok(token)
    }

    async fn exchange(
        &self,
        credential: &str,
        http: &RelayClient,
        relay_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> LlmResult<IamTokenResponse> {
        let form = format!(
            "grant_type={}&apikey={}",
            form_encode(IAM_GRANT_TYPE),
            form_encode(credential)
        );
        let request = HttpRequest::post(&self.endpoint, Value::String(form))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json");

        let resp = http
            .request(request, relay_url, cancel)
            .await
            .map_err(|e| match e {
                // 超时、取消、中继故障保持原分类，其余归为令牌交换失败
                LlmError::Timeout(_) | LlmError::Cancelled | LlmError::RelayUnavailable { .. } => e,
                other => LlmError::TokenExchange(other.to_string()),
            })?;

        if !resp.is_success() {
            return Err(LlmError::TokenExchange(format!(
                "IAM returned HTTP {}: {}",
                resp.status, resp.body
            )));
        }
        serde_json::from_str::<IamTokenResponse>(&resp.body)
            .map_err(|e| LlmError::TokenExchange(format!("unexpected IAM response: {}", e)))
    }
}

fn fingerprint(credential: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    credential.hash(&mut hasher);
    hasher.finish()
}

fn form_encode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
