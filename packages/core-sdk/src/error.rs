use std::time::Duration;

use crate::models::ProviderKind;

/** \brief 直连失败时附加在错误末尾的提示。 */
pub const RELAY_HINT: &str =
    " Hint: the request was sent directly; if this is a browser CORS block, enable the CORS relay in settings.";

/**
 * \brief 核心调用的错误分类。每个错误只影响当前这一次调用。
 */
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    /** \brief 本地即可发现的配置问题（缺少 Key、格式不对、缺少模型），不会发起网络请求 */
    #[error("{provider} configuration error: {message}")]
    Configuration {
        provider: &'static str,
        message: String,
    },
    /** \brief 中继不可达，或中继自身返回了非 2xx */
    #[error("CORS relay unavailable at {relay_url}: {reason}. Start or check the relay process.")]
    RelayUnavailable { relay_url: String, reason: String },
    /** \brief 上游 Provider 返回非 2xx（直连或经由中继） */
    #[error("upstream returned HTTP {status}: {body}{hint}")]
    UpstreamHttp {
        status: u16,
        body: String,
        hint: String,
    },
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
    /** \brief 直连时的传输层失败（DNS、连接被拒等） */
    #[error("network error: {0}")]
    Network(String),
}

impl LlmError {
    pub fn configuration(provider: ProviderKind, message: impl Into<String>) -> Self {
        LlmError::Configuration {
            provider: provider.display_name(),
            message: message.into(),
        }
    }

    /**
     * \brief 构造上游错误；未使用中继时附带开启中继的提示。
     */
    pub fn upstream(status: u16, body: impl Into<String>, relay_used: bool) -> Self {
        LlmError::UpstreamHttp {
            status,
            body: body.into(),
            hint: if relay_used {
                String::new()
            } else {
                RELAY_HINT.to_string()
            },
        }
    }

    /** \brief 上游错误的状态码。 */
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::UpstreamHttp { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_relay_failure(&self) -> bool {
        matches!(self, LlmError::RelayUnavailable { .. })
    }

    /** \brief 错误类别短名，用于日志（不含上游返回内容）。 */
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Configuration { .. } => "configuration",
            LlmError::RelayUnavailable { .. } => "relay_unavailable",
            LlmError::UpstreamHttp { .. } => "upstream_http",
            LlmError::TokenExchange(_) => "token_exchange",
            LlmError::Timeout(_) => "timeout",
            LlmError::Cancelled => "cancelled",
            LlmError::Network(_) => "network",
        }
    }
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;
