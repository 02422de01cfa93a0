use serde::{Deserialize, Serialize};

/**
 * \brief 支持的 LLM Provider 类型。`None` 表示离线模式，不发起任何网络请求。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    None,
    #[serde(rename = "openai")]
    OpenAI,
    Claude,
    Watsonx,
    Ollama,
}

impl ProviderKind {
    /** \brief 所有可联网的 Provider，按设置界面的展示顺序排列。 */
    pub const NETWORKED: [ProviderKind; 4] = [
        ProviderKind::OpenAI,
        ProviderKind::Claude,
        ProviderKind::Watsonx,
        ProviderKind::Ollama,
    ];

    /**
     * \brief 解析 Provider 名称（大小写不敏感），未知名称返回 None 由调用方决定回退策略。
     */
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(ProviderKind::None),
            "openai" => Some(ProviderKind::OpenAI),
            "claude" | "anthropic" => Some(ProviderKind::Claude),
            "watsonx" | "ibm" => Some(ProviderKind::Watsonx),
            "ollama" => Some(ProviderKind::Ollama),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::None => "none",
            ProviderKind::OpenAI => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::Watsonx => "watsonx",
            ProviderKind::Ollama => "ollama",
        }
    }

    /** \brief 人类可读名称，用于错误提示。 */
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::None => "Offline mode",
            ProviderKind::OpenAI => "OpenAI",
            ProviderKind::Claude => "Anthropic Claude",
            ProviderKind::Watsonx => "IBM Watsonx",
            ProviderKind::Ollama => "Ollama",
        }
    }

    /** \brief 是否需要 API Key 鉴权。 */
    pub fn requires_key(&self) -> bool {
        matches!(
            self,
            ProviderKind::OpenAI | ProviderKind::Claude | ProviderKind::Watsonx
        )
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::None => "",
            ProviderKind::OpenAI => "https://api.openai.com/v1",
            ProviderKind::Claude => "https://api.anthropic.com",
            ProviderKind::Watsonx => "https://us-south.ml.cloud.ibm.com",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::None => "",
            ProviderKind::OpenAI => "gpt-4o-mini",
            ProviderKind::Claude => "claude-3-5-sonnet-20241022",
            ProviderKind::Watsonx => "ibm/granite-3-8b-instruct",
            ProviderKind::Ollama => "llama3.2",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly 3D avatar assistant. \
Keep replies short, warm and conversational because they are spoken aloud.";

pub const DEFAULT_RELAY_URL: &str = "http://localhost:3001/proxy";

/**
 * \brief 单个 Provider 的子配置。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /** \brief API Key 或 Bearer Token，空串视为未配置 */
    #[serde(default)]
    pub api_key: String,
    /** \brief 模型 ID，命名空间由 Provider 决定 */
    pub model: String,
    /** \brief 覆盖默认 API 基地址 */
    #[serde(default)]
    pub base_url: Option<String>,
    /** \brief Watsonx 项目 ID，其他 Provider 忽略 */
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ProviderConfig {
    pub fn defaults_for(kind: ProviderKind) -> Self {
        Self {
            api_key: String::new(),
            model: kind.default_model().to_string(),
            base_url: None,
            project_id: None,
        }
    }
}

/**
 * \brief CORS 中继设置。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    pub enabled: bool,
    pub relay_url: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_url: DEFAULT_RELAY_URL.to_string(),
        }
    }
}

/**
 * \brief 持久化的完整设置文档。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub provider: ProviderKind,
    pub system_prompt: String,
    pub relay: RelaySettings,
    pub openai: ProviderConfig,
    pub claude: ProviderConfig,
    pub watsonx: ProviderConfig,
    pub ollama: ProviderConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            relay: RelaySettings::default(),
            openai: ProviderConfig::defaults_for(ProviderKind::OpenAI),
            claude: ProviderConfig::defaults_for(ProviderKind::Claude),
            watsonx: ProviderConfig::defaults_for(ProviderKind::Watsonx),
            ollama: ProviderConfig::defaults_for(ProviderKind::Ollama),
        }
    }
}

impl AppSettings {
    /** \brief 按 Provider 取子配置；`None` 没有子配置。 */
    pub fn provider_config(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        match kind {
            ProviderKind::None => None,
            ProviderKind::OpenAI => Some(&self.openai),
            ProviderKind::Claude => Some(&self.claude),
            ProviderKind::Watsonx => Some(&self.watsonx),
            ProviderKind::Ollama => Some(&self.ollama),
        }
    }

    pub fn provider_config_mut(&mut self, kind: ProviderKind) -> Option<&mut ProviderConfig> {
        match kind {
            ProviderKind::None => None,
            ProviderKind::OpenAI => Some(&mut self.openai),
            ProviderKind::Claude => Some(&mut self.claude),
            ProviderKind::Watsonx => Some(&mut self.watsonx),
            ProviderKind::Ollama => Some(&mut self.ollama),
        }
    }

    /**
     * \brief 解析出当前激活 Provider 的调用配置。
     */
    pub fn active(&self) -> ProviderSettings {
        self.resolve(self.provider)
    }

    /**
     * \brief 解析出指定 Provider 的调用配置（不改变当前选择），供模型列表等场景使用。
     */
    pub fn resolve(&self, kind: ProviderKind) -> ProviderSettings {
        let cfg = self.provider_config(kind);
        let api_key = cfg
            .map(|c| c.api_key.trim())
            .filter(|k| !k.is_empty() && kind.requires_key())
            .map(str::to_string);
        ProviderSettings {
            provider: kind,
            api_key,
            model: cfg.map(|c| c.model.clone()).unwrap_or_default(),
            base_url: cfg.and_then(|c| c.base_url.clone()),
            project_id: cfg.and_then(|c| c.project_id.clone()),
            system_prompt: self.system_prompt.clone(),
            relay: self.relay.clone(),
        }
    }
}

/**
 * \brief 单次调用使用的 Provider 配置快照。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub provider: ProviderKind,
    /** \brief ollama 或未填写时为 None */
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: Option<String>,
    pub project_id: Option<String>,
    pub system_prompt: String,
    pub relay: RelaySettings,
}

impl ProviderSettings {
    /** \brief 实际使用的 API 基地址（去掉结尾斜杠）。 */
    pub fn effective_base_url(&self) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /** \brief 中继开启时返回中继地址。 */
    pub fn relay_url(&self) -> Option<&str> {
        if self.relay.enabled && !self.relay.relay_url.trim().is_empty() {
            Some(self.relay.relay_url.trim())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 对话中的一轮消息，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/**
 * \brief 模型列表结果；`error` 非空表示列表来自静态兜底。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<String>,
    pub error: Option<String>,
}

/**
 * \brief 通知渲染层的头像状态，仅作提示用途。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarMode {
    Idle,
    Thinking,
    Speaking,
}
