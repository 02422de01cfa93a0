use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::credentials::sanitize_model;
use crate::models::{AppSettings, ProviderConfig, ProviderKind, ProviderSettings};

/** \brief 设置文档在键值存储中的键名。 */
pub const SETTINGS_KEY: &str = "nexus.settings";

/**
 * \brief 设置持久化后端：只需要字符串键值读写。
 */
pub trait SettingsBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/**
 * \brief 进程内存后端，用于测试或存储不可用的会话。
 */
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
}

impl SettingsBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self
            .values
            .lock()
            .map_err(|_| anyhow!("memory backend poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self
            .values
            .lock()
            .map_err(|_| anyhow!("memory backend poisoned"))?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/**
 * \brief 单个 Provider 子配置的部分更新。`Some("")` 清空可选字段。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPatch {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPatch {
    pub enabled: Option<bool>,
    pub relay_url: Option<String>,
}

/**
 * \brief 设置的部分更新，字段级合并；持久化文档也按此结构解析，缺失字段沿用默认值。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    /** \brief 原始 Provider 名称，无法识别时回退为 none */
    pub provider: Option<String>,
    pub system_prompt: Option<String>,
    pub relay: Option<RelayPatch>,
    pub openai: Option<ProviderPatch>,
    pub claude: Option<ProviderPatch>,
    pub watsonx: Option<ProviderPatch>,
    pub ollama: Option<ProviderPatch>,
}

impl SettingsPatch {
    /**
     * \brief 便捷构造：只更新某个 Provider 的子配置。
     */
    pub fn for_provider(kind: ProviderKind, patch: ProviderPatch) -> Self {
        let mut out = SettingsPatch::default();
        match kind {
            ProviderKind::None => {}
            ProviderKind::OpenAI => out.openai = Some(patch),
            ProviderKind::Claude => out.claude = Some(patch),
            ProviderKind::Watsonx => out.watsonx = Some(patch),
            ProviderKind::Ollama => out.ollama = Some(patch),
        }
        out
    }
}

fn optional_field(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn apply_provider_patch(kind: ProviderKind, target: &mut ProviderConfig, patch: ProviderPatch) {
    if let Some(key) = patch.api_key {
        target.api_key = key.trim().to_string();
    }
    if let Some(model) = patch.model {
        let model = sanitize_model(kind, &model);
        target.model = if model.is_empty() {
            kind.default_model().to_string()
        } else {
            model
        };
    }
    if let Some(base) = patch.base_url {
        target.base_url = optional_field(base);
    }
    if let Some(project) = patch.project_id {
        target.project_id = optional_field(project);
    }
}

/**
 * \brief 将部分更新逐字段应用到设置上。未知 Provider 名称记录告警并回退为 none，不返回错误。
 */
pub fn apply_patch(settings: &mut AppSettings, patch: SettingsPatch) {
    if let Some(raw) = patch.provider {
        settings.provider = ProviderKind::parse(&raw).unwrap_or_else(|| {
            tracing::warn!(provider = %raw, "unrecognized provider, falling back to none");
            ProviderKind::None
        });
    }
    if let Some(prompt) = patch.system_prompt {
        settings.system_prompt = prompt;
    }
    if let Some(relay) = patch.relay {
        if let Some(enabled) = relay.enabled {
            settings.relay.enabled = enabled;
        }
        if let Some(url) = relay.relay_url {
            settings.relay.relay_url = url.trim().to_string();
        }
    }
    let per_provider = [
        (ProviderKind::OpenAI, patch.openai),
        (ProviderKind::Claude, patch.claude),
        (ProviderKind::Watsonx, patch.watsonx),
        (ProviderKind::Ollama, patch.ollama),
    ];
    for (kind, sub) in per_provider {
        if let (Some(sub), Some(target)) = (sub, settings.provider_config_mut(kind)) {
            apply_provider_patch(kind, target, sub);
        }
    }
}

/**
 * \brief 设置存储：内存中保存当前设置，更新时写回后端。
 * \details 持久化失败只记录告警，内存中的设置在本会话内依旧有效。
 */
pub struct SettingsStore {
    backend: Box<dyn SettingsBackend>,
    current: RwLock<AppSettings>,
}

impl SettingsStore {
    /**
     * \brief 从后端加载设置并合并到默认值之上；读取或解析失败时使用默认值。
     */
    pub fn load(backend: Box<dyn SettingsBackend>) -> Self {
        let mut settings = AppSettings::default();
        match backend.get(SETTINGS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<SettingsPatch>(&raw) {
                Ok(patch) => apply_patch(&mut settings, patch),
                Err(err) => tracing::warn!("persisted settings unreadable, using defaults: {}", err),
            },
            Ok(None) => {}
            Err(err) => tracing::warn!("settings storage unavailable, using defaults: {}", err),
        }
        Self {
            backend,
            current: RwLock::new(settings),
        }
    }

    /** \brief 使用内存后端（不落盘）。 */
    pub fn in_memory() -> Self {
        Self::load(Box::new(MemoryBackend::default()))
    }

    /**
     * \brief 当前激活 Provider 的调用配置（拷贝）。
     */
    pub fn get(&self) -> ProviderSettings {
        self.snapshot().active()
    }

    /**
     * \brief 完整设置文档的拷贝。
     */
    pub fn snapshot(&self) -> AppSettings {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /**
     * \brief 应用部分更新并尝试持久化，返回更新后的设置。
     */
    pub fn update(&self, patch: SettingsPatch) -> AppSettings {
        let updated = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            apply_patch(&mut guard, patch);
            guard.clone()
        };
        if let Err(err) = self.persist(&updated) {
            tracing::warn!("failed to persist settings, keeping them in memory: {}", err);
        }
        updated
    }

    fn persist(&self, settings: &AppSettings) -> Result<()> {
        let raw = serde_json::to_string(settings)?;
        self.backend.set(SETTINGS_KEY, &raw)
    }
}
