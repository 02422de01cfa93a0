use std::{sync::Arc, time::Duration, time::Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::catalog;
use crate::credentials::{is_valid_key_format, key_format_hint, sanitize_model};
use crate::error::{LlmError, LlmResult};
use crate::models::{
    AvatarMode, ConversationTurn, ModelCatalog, ProviderKind, ProviderSettings, Role,
};
use crate::relay::{HttpRequest, RelayClient, DEFAULT_TIMEOUT};
use crate::telemetry;
use crate::token::{TokenExchanger, IBM_IAM_TOKEN_URL};

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const WATSONX_API_VERSION: &str = "2023-05-29";

const OPENAI_MAX_TOKENS: u32 = 500;
const CLAUDE_MAX_TOKENS: u32 = 1024;
const WATSONX_MAX_NEW_TOKENS: u32 = 400;
const WATSONX_STOP_SEQUENCE: &str = "\nUser:";

/** \brief 上游成功返回但没有可用文本时的兜底回复。 */
pub const EMPTY_REPLY_PLACEHOLDER: &str = "Hmm, I didn't get a reply from the model. Could you try again?";

/** \brief 未选择 Provider 时的本地回复。 */
pub const OFFLINE_REPLY: &str =
    "I'm in offline mode right now. Pick an AI provider in settings and I'll be able to chat properly!";

/**
 * \brief 渲染层回调：接收头像状态变化，仅作提示。
 */
pub trait ModeObserver: Send + Sync {
    fn on_mode(&self, mode: AvatarMode);
}

/**
 * \brief LlmManager 的构造参数。
 */
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /** \brief 单次请求超时 */
    pub timeout: Duration,
    /** \brief IBM IAM 令牌端点 */
    pub iam_url: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            iam_url: IBM_IAM_TOKEN_URL.to_string(),
        }
    }
}

/**
 * \brief 多 Provider 请求路由。由应用显式构造并持有，自带令牌缓存，测试间互不影响。
 */
pub struct LlmManager {
    http: RelayClient,
    watsonx_tokens: TokenExchanger,
    observer: Option<Arc<dyn ModeObserver>>,
}

impl Default for LlmManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl LlmManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            http: RelayClient::new(config.timeout),
            watsonx_tokens: TokenExchanger::new(config.iam_url),
            observer: None,
        }
    }

    pub fn with_token_exchanger(mut self, exchanger: TokenExchanger) -> Self {
        self.watsonx_tokens = exchanger;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ModeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /**
     * \brief 发送一轮对话，返回助手的纯文本回复。
     * \param settings 当前 Provider 配置快照
     * \param user_message 本轮用户输入
     * \param system_prompt 系统提示，为空时使用 history 中的 system 轮
     * \param history 之前的对话（由调用方维护）
     */
    pub async fn send(
        &self,
        settings: &ProviderSettings,
        user_message: &str,
        system_prompt: &str,
        history: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> LlmResult<String> {
        if settings.provider == ProviderKind::None {
            return Ok(OFFLINE_REPLY.to_string());
        }

        self.notify(AvatarMode::Thinking);
        let started = Instant::now();
        let system = resolve_system_prompt(system_prompt, history);
        let result = match settings.provider {
            ProviderKind::None => Ok(OFFLINE_REPLY.to_string()),
            ProviderKind::OpenAI => self.send_openai(settings, user_message, system, history, cancel).await,
            ProviderKind::Claude => self.send_claude(settings, user_message, system, history, cancel).await,
            ProviderKind::Watsonx => self.send_watsonx(settings, user_message, system, history, cancel).await,
            ProviderKind::Ollama => self.send_ollama(settings, user_message, system, history, cancel).await,
        };

        let elapsed_ms = started.elapsed().as_millis();
        match &result {
            Ok(text) => {
                self.notify(AvatarMode::Speaking);
                telemetry::log_event(
                    "llm.send",
                    &format!(
                        "provider={} model={} relay={} history={} reply_len={} elapsed_ms={}",
                        settings.provider,
                        settings.model,
                        settings.relay_url().is_some(),
                        history.len(),
                        text.len(),
                        elapsed_ms
                    ),
                );
            }
            Err(err) => {
                self.notify(AvatarMode::Idle);
                telemetry::log_error(
                    "llm.send",
                    &format!(
                        "provider={} model={} relay={} error={} status={:?} elapsed_ms={}",
                        settings.provider,
                        settings.model,
                        settings.relay_url().is_some(),
                        err.kind(),
                        err.status(),
                        elapsed_ms
                    ),
                );
            }
        }
        result
    }

    /**
     * \brief 拉取当前 Provider 的模型列表，失败时返回静态兜底列表，不会报错。
     */
    pub async fn fetch_models(
        &self,
        settings: &ProviderSettings,
        cancel: &CancellationToken,
    ) -> ModelCatalog {
        catalog::fetch_models(&self.http, settings, cancel).await
    }

    fn notify(&self, mode: AvatarMode) {
        if let Some(observer) = &self.observer {
            observer.on_mode(mode);
        }
    }

    async fn send_openai(
        &self,
        settings: &ProviderSettings,
        user_message: &str,
        system: Option<&str>,
        history: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> LlmResult<String> {
        let key = require_key(settings)?;
        let model = require_model(settings)?;
        let url = format!("{}/chat/completions", settings.effective_base_url());
        let body = json!({
            "model": model,
            "messages": chat_messages(system, history, user_message),
            "max_tokens": OPENAI_MAX_TOKENS,
            "temperature": 0.7,
        });
        let request =
            HttpRequest::post(url, body).header("Authorization", format!("Bearer {}", key));
        let v = self.execute(request, settings.relay_url(), cancel).await?;
        Ok(non_empty_or_placeholder(extract_openai_content(&v)))
    }

    async fn send_claude(
        &self,
        settings: &ProviderSettings,
        user_message: &str,
        system: Option<&str>,
        history: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> LlmResult<String> {
        let key = require_key(settings)?;
        let model = require_model(settings)?;
        let url = format!("{}/v1/messages", settings.effective_base_url());
        let mut body = json!({
            "model": model,
            "max_tokens": CLAUDE_MAX_TOKENS,
            "messages": anthropic_messages(history, user_message),
        });
        if let Some(sys) = system {
            body["system"] = json!(sys);
        }
        let request = HttpRequest::post(url, body)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-dangerous-direct-browser-access", "true");
        let v = self.execute(request, settings.relay_url(), cancel).await?;
        Ok(non_empty_or_placeholder(extract_anthropic_content(&v)))
    }

    async fn send_ollama(
        &self,
        settings: &ProviderSettings,
        user_message: &str,
        system: Option<&str>,
        history: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> LlmResult<String> {
        let model = require_model(settings)?;
        let url = format!("{}/api/chat", settings.effective_base_url());
        let body = json!({
            "model": model,
            "messages": chat_messages(system, history, user_message),
            "stream": false,
        });
        // 本地服务，不在中继白名单内，始终直连
        let v = self
            .execute(HttpRequest::post(url, body), None, cancel)
            .await?;
        Ok(non_empty_or_placeholder(extract_ollama_content(&v)))
    }

    async fn send_watsonx(
        &self,
        settings: &ProviderSettings,
        user_message: &str,
        system: Option<&str>,
        history: &[ConversationTurn],
        cancel: &CancellationToken,
    ) -> LlmResult<String> {
        let key = require_key(settings)?;
        let model = require_model(settings)?;
        let project_id = settings
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                LlmError::configuration(
                    ProviderKind::Watsonx,
                    "a project ID is required; copy it from your watsonx.ai project's Manage tab",
                )
            })?;

        let relay_url = settings.relay_url();
        let bearer = self
            .watsonx_tokens
            .get_bearer(key, &self.http, relay_url, cancel)
            .await?;

        let url = format!(
            "{}/ml/v1/text/generation?version={}",
            settings.effective_base_url(),
            WATSONX_API_VERSION
        );
        let body = json!({
            "model_id": model,
            "project_id": project_id,
            "input": watsonx_prompt(system, history, user_message),
            "parameters": {
                "decoding_method": "greedy",
                "max_new_tokens": WATSONX_MAX_NEW_TOKENS,
                "min_new_tokens": 1,
                "stop_sequences": [WATSONX_STOP_SEQUENCE],
                "repetition_penalty": 1.05
            }
        });
        let request = HttpRequest::post(url, body)
            .header("Authorization", format!("Bearer {}", bearer))
            .header("Accept", "application/json");
        let v = self.execute(request, relay_url, cancel).await?;
        Ok(non_empty_or_placeholder(extract_watsonx_content(&v)))
    }

    /**
     * \brief 发出请求；非 2xx 转为 UpstreamHttp，2xx 解析为 JSON（解析失败视为空对象）。
     */
    async fn execute(
        &self,
        request: HttpRequest,
        relay_url: Option<&str>,
        cancel: &CancellationToken,
    ) -> LlmResult<Value> {
        let resp = self.http.request(request, relay_url, cancel).await?;
        if !resp.is_success() {
            return Err(LlmError::upstream(resp.status, resp.body, relay_url.is_some()));
        }
        Ok(resp.json().unwrap_or(Value::Null))
    }
}

fn require_key(settings: &ProviderSettings) -> LlmResult<&str> {
    let provider = settings.provider;
    let key = settings
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            LlmError::configuration(
                provider,
                format!("API key is missing. {}.", key_format_hint(provider)),
            )
        })?;
    if !is_valid_key_format(provider, key) {
        return Err(LlmError::configuration(
            provider,
            format!("API key has an unexpected format. {}.", key_format_hint(provider)),
        ));
    }
    Ok(key)
}

fn require_model(settings: &ProviderSettings) -> LlmResult<String> {
    let model = sanitize_model(settings.provider, &settings.model);
    if model.is_empty() {
        return Err(LlmError::configuration(
            settings.provider,
            format!(
                "no model selected; pick one in settings (for example \"{}\")",
                settings.provider.default_model()
            ),
        ));
    }
    Ok(model)
}

/**
 * \brief 系统提示只出现一次：优先使用显式参数，否则取 history 中第一条 system 轮。
 */
fn resolve_system_prompt<'a>(
    system_prompt: &'a str,
    history: &'a [ConversationTurn],
) -> Option<&'a str> {
    let explicit = system_prompt.trim();
    if !explicit.is_empty() {
        return Some(explicit);
    }
    history
        .iter()
        .find(|t| t.role == Role::System)
        .map(|t| t.content.trim())
        .filter(|s| !s.is_empty())
}

fn dialogue(history: &[ConversationTurn]) -> impl Iterator<Item = &ConversationTurn> {
    history.iter().filter(|t| t.role != Role::System)
}

/**
 * \brief Chat 风格的 messages 数组：system + 历史 + 本轮用户输入。
 */
fn chat_messages(
    system: Option<&str>,
    history: &[ConversationTurn],
    user_message: &str,
) -> Vec<Value> {
    let mut items = Vec::with_capacity(history.len() + 2);
    if let Some(sys) = system {
        items.push(json!({"role": "system", "content": sys}));
    }
    for turn in dialogue(history) {
        items.push(json!({"role": turn.role.as_str(), "content": turn.content}));
    }
    items.push(json!({"role": "user", "content": user_message}));
    items
}

/**
 * \brief Anthropic 要求 user/assistant 交替且以 user 开头：合并相邻同角色消息，丢弃开头的 assistant。
 */
fn anthropic_messages(history: &[ConversationTurn], user_message: &str) -> Vec<Value> {
    let mut merged: Vec<(Role, String)> = Vec::new();
    let turns = dialogue(history)
        .map(|t| (t.role, t.content.as_str()))
        .chain(std::iter::once((Role::User, user_message)));
    for (role, content) in turns {
        if merged.is_empty() && role == Role::Assistant {
            continue;
        }
        if let Some((last_role, text)) = merged.last_mut() {
            if *last_role == role {
                text.push_str("\n\n");
                text.push_str(content);
                continue;
            }
        }
        merged.push((role, content.to_string()));
    }
    merged
        .into_iter()
        .map(|(role, text)| {
            json!({
                "role": role.as_str(),
                "content": [{"type": "text", "text": text}]
            })
        })
        .collect()
}

/**
 * \brief 补全式 Provider 的单字符串 prompt：带说话人标签，末尾留出 Assistant 提示。
 */
fn watsonx_prompt(
    system: Option<&str>,
    history: &[ConversationTurn],
    user_message: &str,
) -> String {
    let mut prompt = String::new();
    if let Some(sys) = system {
        prompt.push_str("System: ");
        prompt.push_str(sys);
        prompt.push_str("\n\n");
    }
    for turn in dialogue(history) {
        let label = match turn.role {
            Role::Assistant => "Assistant",
            _ => "User",
        };
        prompt.push_str(label);
        prompt.push_str(": ");
        prompt.push_str(turn.content.trim());
        prompt.push('\n');
    }
    prompt.push_str("User: ");
    prompt.push_str(user_message.trim());
    prompt.push_str("\nAssistant:");
    prompt
}

fn non_empty_or_placeholder(text: String) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        EMPTY_REPLY_PLACEHOLDER.to_string()
    } else {
        trimmed.to_string()
    }
}

fn join_text_parts(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(arr) => Some(
            arr.iter()
                .filter_map(|item| {
                    item.get("text")
                        .and_then(|t| t.as_str())
                        .or_else(|| item.as_str())
                })
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    }
}

fn extract_openai_content(v: &Value) -> String {
    v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(join_text_parts)
        .unwrap_or_default()
}

fn extract_anthropic_content(v: &Value) -> String {
    v.get("content")
        .and_then(|arr| arr.as_array())
        .map(|arr| {
            arr.iter()
                .filter(|item| item.get("type").and_then(|t| t.as_str()).unwrap_or("text") == "text")
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn extract_ollama_content(v: &Value) -> String {
    v.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| v.get("response").and_then(|r| r.as_str()))
        .unwrap_or("")
        .to_string()
}

fn extract_watsonx_content(v: &Value) -> String {
    let text = v
        .get("results")
        .and_then(|r| r.get(0))
        .and_then(|r| r.get("generated_text"))
        .and_then(|t| t.as_str())
        .unwrap_or("");
    text.trim_end()
        .strip_suffix("User:")
        .unwrap_or(text)
        .trim()
        .to_string()
}
