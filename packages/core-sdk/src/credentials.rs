use crate::models::ProviderKind;

const OPENAI_KEY_PREFIX: &str = "sk-";
const CLAUDE_KEY_PREFIX: &str = "sk-ant-";
const OPENAI_MIN_KEY_LEN: usize = 20;
const CLAUDE_MIN_KEY_LEN: usize = 40;
const WATSONX_MIN_KEY_LEN: usize = 32;

/**
 * \brief 上游不接受的滚动别名 -> 固定版本号。
 * \details 目标值不能再出现在左侧，否则 sanitize_model 不再幂等。
 */
const CLAUDE_ALIASES: &[(&str, &str)] = &[
    ("claude-3-5-sonnet-latest", "claude-3-5-sonnet-20241022"),
    ("claude-3-5-haiku-latest", "claude-3-5-haiku-20241022"),
    ("claude-3-7-sonnet-latest", "claude-3-7-sonnet-20250219"),
    ("claude-3-opus-latest", "claude-3-opus-20240229"),
    ("claude-sonnet-4-latest", "claude-sonnet-4-20250514"),
];

const OPENAI_ALIASES: &[(&str, &str)] = &[
    ("gpt-4-vision-preview", "gpt-4o"),
    ("gpt-4o-latest", "gpt-4o"),
    ("gpt-3.5-turbo-0301", "gpt-3.5-turbo"),
];

const WATSONX_ALIASES: &[(&str, &str)] = &[
    ("ibm/granite-13b-chat-v2", "ibm/granite-3-8b-instruct"),
    ("ibm/granite-13b-instruct-v2", "ibm/granite-3-8b-instruct"),
    ("meta-llama/llama-2-70b-chat", "meta-llama/llama-3-3-70b-instruct"),
];

fn alias_table(provider: ProviderKind) -> &'static [(&'static str, &'static str)] {
    match provider {
        ProviderKind::OpenAI => OPENAI_ALIASES,
        ProviderKind::Claude => CLAUDE_ALIASES,
        ProviderKind::Watsonx => WATSONX_ALIASES,
        ProviderKind::Ollama | ProviderKind::None => &[],
    }
}

/**
 * \brief 规范化模型 ID：去空白，并把已知的弃用别名替换为固定版本。
 */
pub fn sanitize_model(provider: ProviderKind, raw_model: &str) -> String {
    let trimmed = raw_model.trim();
    alias_table(provider)
        .iter()
        .find(|(alias, _)| *alias == trimmed)
        .map(|(_, pinned)| (*pinned).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/**
 * \brief 按 Provider 校验 Key 的格式；不需要 Key 的 Provider 永远返回 true。
 */
pub fn is_valid_key_format(provider: ProviderKind, key: &str) -> bool {
    let key = key.trim();
    match provider {
        ProviderKind::OpenAI => {
            key.starts_with(OPENAI_KEY_PREFIX)
                && !key.starts_with(CLAUDE_KEY_PREFIX)
                && key.len() >= OPENAI_MIN_KEY_LEN
        }
        ProviderKind::Claude => key.starts_with(CLAUDE_KEY_PREFIX) && key.len() >= CLAUDE_MIN_KEY_LEN,
        ProviderKind::Watsonx => {
            if looks_like_jwt(key) {
                return true;
            }
            !key.starts_with(OPENAI_KEY_PREFIX)
                && key.len() >= WATSONX_MIN_KEY_LEN
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        ProviderKind::Ollama | ProviderKind::None => true,
    }
}

/**
 * \brief 对期望的 Key 格式的描述，拼接进配置错误提示里。
 */
pub fn key_format_hint(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::OpenAI => {
            "OpenAI keys start with \"sk-\" (not \"sk-ant-\") and are at least 20 characters long"
        }
        ProviderKind::Claude => {
            "Anthropic keys start with \"sk-ant-\" and are at least 40 characters long"
        }
        ProviderKind::Watsonx => {
            "IBM Cloud API keys are 32+ characters of letters, digits, '-' or '_' (or paste an IAM bearer token)"
        }
        ProviderKind::Ollama | ProviderKind::None => "no API key is required",
    }
}

/**
 * \brief 启发式判断凭据是否已经是 Bearer Token（JWT 形状：三段非空 base64url，用点分隔）。
 * \details 只看形状不验签；是否应改为在配置时显式声明凭据类型尚未定论。
 */
pub fn looks_like_jwt(credential: &str) -> bool {
    let parts: Vec<&str> = credential.trim().split('.').collect();
    parts.len() == 3
        && parts.iter().all(|p| {
            !p.is_empty()
                && p
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '=')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODELS: &[&str] = &[
        "",
        "  gpt-4o  ",
        "gpt-4-vision-preview",
        "claude-3-5-sonnet-latest",
        " claude-3-opus-latest",
        "ibm/granite-13b-chat-v2",
        "llama3.2",
        "something-unknown",
    ];

    #[test]
    fn test_sanitize_model_is_idempotent_for_every_provider() {
        let all = [
            ProviderKind::None,
            ProviderKind::OpenAI,
            ProviderKind::Claude,
            ProviderKind::Watsonx,
            ProviderKind::Ollama,
        ];
        for provider in all {
            for raw in MODELS {
                let once = sanitize_model(provider, raw);
                assert_eq!(sanitize_model(provider, &once), once, "{provider} {raw:?}");
            }
            for (_, pinned) in alias_table(provider) {
                assert!(
                    alias_table(provider).iter().all(|(a, _)| a != pinned),
                    "pinned id {pinned} must not also be an alias"
                );
            }
        }
    }

    #[test]
    fn test_sanitize_model_rewrites_only_mapped_aliases() {
        assert_eq!(
            sanitize_model(ProviderKind::Claude, " claude-3-5-sonnet-latest "),
            "claude-3-5-sonnet-20241022"
        );
        // 别名表按 Provider 隔离
        assert_eq!(
            sanitize_model(ProviderKind::OpenAI, "claude-3-5-sonnet-latest"),
            "claude-3-5-sonnet-latest"
        );
        assert_eq!(sanitize_model(ProviderKind::Ollama, " llama3 "), "llama3");
    }

    #[test]
    fn test_competing_prefixes_rejected_everywhere_else() {
        let claude_keys: Vec<String> = (0..60)
            .map(|n| format!("sk-ant-{}", "a".repeat(n)))
            .collect();
        for key in &claude_keys {
            assert!(!is_valid_key_format(ProviderKind::OpenAI, key), "{key}");
            assert!(!is_valid_key_format(ProviderKind::Watsonx, key), "{key}");
        }

        let openai_keys: Vec<String> = (0..60)
            .map(|n| format!("sk-proj-{}", "b".repeat(n)))
            .collect();
        for key in &openai_keys {
            assert!(!is_valid_key_format(ProviderKind::Claude, key), "{key}");
            assert!(!is_valid_key_format(ProviderKind::Watsonx, key), "{key}");
        }

        let ibm_keys: Vec<String> = (0..60).map(|n| "k".repeat(n)).collect();
        for key in &ibm_keys {
            assert!(!is_valid_key_format(ProviderKind::OpenAI, key), "{key}");
            assert!(!is_valid_key_format(ProviderKind::Claude, key), "{key}");
        }
    }

    #[test]
    fn test_valid_keys_accepted() {
        assert!(is_valid_key_format(
            ProviderKind::OpenAI,
            "sk-proj-abcdefghijklmnopqrstuvwxyz"
        ));
        assert!(is_valid_key_format(
            ProviderKind::Claude,
            &format!("sk-ant-api03-{}", "x".repeat(40))
        ));
        assert!(is_valid_key_format(ProviderKind::Watsonx, &"A1_b-".repeat(8)));
        assert!(is_valid_key_format(ProviderKind::Watsonx, "aaa.bbb.ccc"));
        assert!(is_valid_key_format(ProviderKind::Ollama, ""));
        assert!(!is_valid_key_format(ProviderKind::OpenAI, "sk-short"));
    }

    #[test]
    fn test_looks_like_jwt() {
        assert!(looks_like_jwt("eyJhbGciOi.eyJzdWIiOiIx.c2lnbmF0dXJl"));
        assert!(!looks_like_jwt("a.b"));
        assert!(!looks_like_jwt("a..c"));
        assert!(!looks_like_jwt("a.b.c.d"));
        assert!(!looks_like_jwt("has space.b.c"));
        assert!(!looks_like_jwt(&"x".repeat(40)));
    }
}
