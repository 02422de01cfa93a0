use std::collections::BTreeSet;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::credentials::is_valid_key_format;
use crate::error::{LlmError, LlmResult};
use crate::llm::{ANTHROPIC_VERSION, WATSONX_API_VERSION};
use crate::models::{ModelCatalog, ProviderKind, ProviderSettings};
use crate::relay::{HttpRequest, RelayClient};

const OPENAI_PREFIXES: [&str; 5] = ["gpt-", "o1", "o3", "o4", "chatgpt-"];
const OPENAI_EXCLUDED: [&str; 6] = ["audio", "realtime", "tts", "transcribe", "embedding", "image"];
const WATSONX_PREFIXES: [&str; 4] = ["ibm/", "meta-llama/", "mistralai/", "google/"];

const WATSONX_REGIONAL_HOSTS: [&str; 6] = [
    "https://us-south.ml.cloud.ibm.com",
    "https://eu-de.ml.cloud.ibm.com",
    "https://eu-gb.ml.cloud.ibm.com",
    "https://jp-tok.ml.cloud.ibm.com",
    "https://au-syd.ml.cloud.ibm.com",
    "https://ca-tor.ml.cloud.ibm.com",
];

/** \brief 各 Provider 的旗舰模型，排序时置顶（按表内顺序）。 */
fn flagship_models(provider: ProviderKind) -> &'static [&'static str] {
    match provider {
        ProviderKind::OpenAI => &["gpt-4o-mini", "gpt-4o", "gpt-4.1-mini", "gpt-4.1"],
        ProviderKind::Claude => &[
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
        ],
        ProviderKind::Watsonx => &[
            "ibm/granite-3-8b-instruct",
            "meta-llama/llama-3-3-70b-instruct",
        ],
        ProviderKind::Ollama => &["llama3.2"],
        ProviderKind::None => &[],
    }
}

/** \brief 拉取失败时使用的静态模型列表。 */
pub fn fallback_models(provider: ProviderKind) -> Vec<String> {
    let list: &[&str] = match provider {
        ProviderKind::OpenAI => &["gpt-4o-mini", "gpt-4o", "gpt-4.1-mini", "gpt-4.1", "o3-mini"],
        ProviderKind::Claude => &[
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-opus-20240229",
        ],
        ProviderKind::Watsonx => &[
            "ibm/granite-3-8b-instruct",
            "ibm/granite-3-2b-instruct",
            "meta-llama/llama-3-3-70b-instruct",
            "mistralai/mistral-large",
        ],
        ProviderKind::Ollama => &["llama3.2", "mistral", "qwen2.5"],
        ProviderKind::None => &[],
    };
    list.iter().map(|s| s.to_string()).collect()
}

/**
 * \brief 拉取模型列表。任何失败都降级为静态列表并附带错误说明，不会返回 Err。
 */
pub async fn fetch_models(
    http: &RelayClient,
    settings: &ProviderSettings,
    cancel: &CancellationToken,
) -> ModelCatalog {
    let provider = settings.provider;
    if provider == ProviderKind::None {
        return ModelCatalog {
            models: Vec::new(),
            error: None,
        };
    }

    let fetched = match provider {
        ProviderKind::OpenAI => fetch_openai(http, settings, cancel).await,
        ProviderKind::Claude => fetch_claude(http, settings, cancel).await,
        ProviderKind::Watsonx => fetch_watsonx(http, settings, cancel).await,
        ProviderKind::Ollama => fetch_ollama(http, settings, cancel).await,
        ProviderKind::None => Ok(Vec::new()),
    };

    match fetched.and_then(|ids| non_empty(provider, ids)) {
        Ok(ids) => ModelCatalog {
            models: prioritize(provider, ids),
            error: None,
        },
        Err(err) => {
            tracing::warn!(provider = %provider, error = err.kind(), "model list fetch failed, using fallback");
            ModelCatalog {
                models: fallback_models(provider),
                error: Some(err.to_string()),
            }
        }
    }
}

fn non_empty(provider: ProviderKind, ids: Vec<String>) -> LlmResult<Vec<String>> {
    if ids.is_empty() {
        Err(LlmError::configuration(
            provider,
            "the provider returned no usable models",
        ))
    } else {
        Ok(ids)
    }
}

fn catalog_key(settings: &ProviderSettings) -> LlmResult<&str> {
    settings
        .api_key
        .as_deref()
        .filter(|k| is_valid_key_format(settings.provider, k))
        .ok_or_else(|| {
            LlmError::configuration(settings.provider, "a valid API key is needed to list models")
        })
}

async fn get_json(
    http: &RelayClient,
    request: HttpRequest,
    relay_url: Option<&str>,
    cancel: &CancellationToken,
) -> LlmResult<Value> {
    let resp = http.request(request, relay_url, cancel).await?;
    if !resp.is_success() {
        return Err(LlmError::upstream(resp.status, resp.body, relay_url.is_some()));
    }
    resp.json()
        .ok_or_else(|| LlmError::Network("model list response is not JSON".to_string()))
}

async fn fetch_openai(
    http: &RelayClient,
    settings: &ProviderSettings,
    cancel: &CancellationToken,
) -> LlmResult<Vec<String>> {
    let key = catalog_key(settings)?;
    let url = format!("{}/models", settings.effective_base_url());
    let request = HttpRequest::get(url).header("Authorization", format!("Bearer {}", key));
    let v = get_json(http, request, settings.relay_url(), cancel).await?;
    Ok(collect_ids(&v, "data", "id")
        .filter(|id| is_openai_chat_model(id))
        .collect())
}

async fn fetch_claude(
    http: &RelayClient,
    settings: &ProviderSettings,
    cancel: &CancellationToken,
) -> LlmResult<Vec<String>> {
    let key = catalog_key(settings)?;
    let url = format!("{}/v1/models", settings.effective_base_url());
    let request = HttpRequest::get(url)
        .header("x-api-key", key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("anthropic-dangerous-direct-browser-access", "true");
    let v = get_json(http, request, settings.relay_url(), cancel).await?;
    Ok(collect_ids(&v, "data", "id")
        .filter(|id| id.starts_with("claude-"))
        .collect())
}

/**
 * \brief Watsonx 模型规格接口无需鉴权；IBM 主机时并查各区域，至少一个成功即可。
 */
async fn fetch_watsonx(
    http: &RelayClient,
    settings: &ProviderSettings,
    cancel: &CancellationToken,
) -> LlmResult<Vec<String>> {
    let mut bases = vec![settings.effective_base_url()];
    if is_ibm_host(&bases[0]) {
        bases.extend(WATSONX_REGIONAL_HOSTS.iter().map(|h| h.to_string()));
    }
    let relay_url = settings.relay_url();
    let requests = dedup_preserving_order(bases).into_iter().map(|base| {
        let url = format!(
            "{}/ml/v1/foundation_model_specs?version={}&filters=function_text_generation&limit=200",
            base, WATSONX_API_VERSION
        );
        async move {
            let v = get_json(http, HttpRequest::get(url), relay_url, cancel).await?;
            Ok::<_, LlmError>(
                collect_ids(&v, "resources", "model_id")
                    .filter(|id| WATSONX_PREFIXES.iter().any(|p| id.starts_with(p)))
                    .collect::<Vec<_>>(),
            )
        }
    });
    union_results(futures_util::future::join_all(requests).await)
}

/**
 * \brief Ollama 本地服务：配置地址及其 localhost/127.0.0.1 变体，始终直连。
 */
async fn fetch_ollama(
    http: &RelayClient,
    settings: &ProviderSettings,
    cancel: &CancellationToken,
) -> LlmResult<Vec<String>> {
    let bases = loopback_variants(&settings.effective_base_url());
    let requests = bases.into_iter().map(|base| {
        let url = format!("{}/api/tags", base);
        async move {
            let v = get_json(http, HttpRequest::get(url), None, cancel).await?;
            Ok::<_, LlmError>(collect_ids(&v, "models", "name").collect::<Vec<_>>())
        }
    });
    union_results(futures_util::future::join_all(requests).await)
}

fn collect_ids<'a>(v: &'a Value, list_key: &str, id_key: &'a str) -> impl Iterator<Item = String> + 'a {
    v.get(list_key)
        .and_then(|arr| arr.as_array())
        .into_iter()
        .flatten()
        .filter_map(move |item| item.get(id_key).and_then(|s| s.as_str()))
        .map(|s| s.to_string())
}

fn is_openai_chat_model(id: &str) -> bool {
    OPENAI_PREFIXES.iter().any(|p| id.starts_with(p))
        && !OPENAI_EXCLUDED.iter().any(|word| id.contains(word))
}

fn is_ibm_host(base: &str) -> bool {
    url::Url::parse(base)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.ends_with(".cloud.ibm.com")))
        .unwrap_or(false)
}

/**
 * \brief 返回配置地址本身，以及主机为回环地址时换成另一种写法的变体。
 */
fn loopback_variants(base: &str) -> Vec<String> {
    let mut out = vec![base.to_string()];
    if let Ok(parsed) = url::Url::parse(base) {
        let swapped = match parsed.host_str() {
            Some("localhost") => Some("127.0.0.1"),
            Some("127.0.0.1") => Some("localhost"),
            _ => None,
        };
        if let Some(host) = swapped {
            let mut variant = parsed.clone();
            if variant.set_host(Some(host)).is_ok() {
                out.push(variant.as_str().trim_end_matches('/').to_string());
            }
        }
    }
    out
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/** \brief 并查结果合并：任一成功即返回并集，全部失败返回第一个错误。 */
fn union_results(results: Vec<LlmResult<Vec<String>>>) -> LlmResult<Vec<String>> {
    let mut ids = Vec::new();
    let mut first_error = None;
    let mut any_ok = false;
    for result in results {
        match result {
            Ok(found) => {
                any_ok = true;
                ids.extend(found);
            }
            Err(err) => {
                tracing::debug!(error = %err, "model list variant failed");
                first_error.get_or_insert(err);
            }
        }
    }
    match (any_ok, first_error) {
        (false, Some(err)) => Err(err),
        _ => Ok(ids),
    }
}

/**
 * \brief 去重后排序：旗舰模型在前（按表内顺序），其余按名称中的日期倒序，再按名称。
 */
fn prioritize(provider: ProviderKind, ids: Vec<String>) -> Vec<String> {
    let flagships = flagship_models(provider);
    let mut ids = dedup_preserving_order(ids);
    ids.sort_by(|a, b| {
        let rank = |id: &str| {
            flagships
                .iter()
                .position(|f| *f == id)
                .unwrap_or(flagships.len())
        };
        rank(a)
            .cmp(&rank(b))
            .then_with(|| embedded_date(b).cmp(&embedded_date(a)))
            .then_with(|| a.cmp(b))
    });
    ids
}

/**
 * \brief 提取模型名中的日期，支持 `20241022` 与 `2024-10-22` 两种写法。
 */
fn embedded_date(id: &str) -> Option<u32> {
    let digits_at = |s: &str| s.len() >= 8 && s.bytes().take(8).all(|b| b.is_ascii_digit());
    for (idx, _) in id.char_indices() {
        let rest = &id[idx..];
        let starts_fresh = idx == 0 || !id.as_bytes()[idx - 1].is_ascii_digit();
        if !starts_fresh {
            continue;
        }
        if digits_at(rest) && rest.as_bytes().get(8).map_or(true, |b| !b.is_ascii_digit()) {
            return rest[..8].parse().ok();
        }
        let bytes = rest.as_bytes();
        if bytes.len() >= 10
            && bytes[4] == b'-'
            && bytes[7] == b'-'
            && bytes[..4].iter().chain(&bytes[5..7]).chain(&bytes[8..10]).all(u8::is_ascii_digit)
        {
            let compact = format!("{}{}{}", &rest[..4], &rest[5..7], &rest[8..10]);
            return compact.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppSettings;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OPENAI_KEY: &str = "sk-test-abcdefghijklmnopqrstuvwxyz";

    fn settings_for(kind: ProviderKind, base: &str, key: &str) -> ProviderSettings {
        let mut app = AppSettings::default();
        let cfg = app.provider_config_mut(kind).expect("networked provider");
        cfg.base_url = Some(base.to_string());
        cfg.api_key = key.to_string();
        app.resolve(kind)
    }

    /** \brief 返回一个没有进程监听的本地地址。 */
    fn dead_base() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    #[test]
    fn test_openai_filter() {
        for keep in ["gpt-4o", "o1-mini", "o3", "o4-mini", "chatgpt-4o-latest"] {
            assert!(is_openai_chat_model(keep), "{keep}");
        }
        for drop in [
            "gpt-4o-audio-preview",
            "gpt-4o-realtime-preview",
            "gpt-4o-mini-tts",
            "gpt-4o-transcribe",
            "text-embedding-3-small",
            "gpt-image-1",
            "dall-e-3",
            "whisper-1",
        ] {
            assert!(!is_openai_chat_model(drop), "{drop}");
        }
    }

    #[test]
    fn test_prioritize_flagship_then_date_then_name() {
        let ids = vec![
            "claude-3-haiku-20240307".to_string(),
            "claude-3-opus-20240229".to_string(),
            "claude-3-5-haiku-20241022".to_string(),
            "claude-sonnet-4-20250514".to_string(),
            "claude-3-5-sonnet-20241022".to_string(),
            "claude-3-haiku-20240307".to_string(),
        ];
        assert_eq!(
            prioritize(ProviderKind::Claude, ids),
            vec![
                "claude-3-5-sonnet-20241022",
                "claude-3-5-haiku-20241022",
                "claude-sonnet-4-20250514",
                "claude-3-haiku-20240307",
                "claude-3-opus-20240229",
            ]
        );
    }

    #[test]
    fn test_embedded_date_formats() {
        assert_eq!(embedded_date("claude-3-opus-20240229"), Some(20240229));
        assert_eq!(embedded_date("gpt-4o-2024-08-06"), Some(20240806));
        assert_eq!(embedded_date("gpt-4o"), None);
        assert_eq!(embedded_date("model-123456789"), None);
    }

    #[test]
    fn test_loopback_variants() {
        assert_eq!(
            loopback_variants("http://localhost:11434"),
            vec!["http://localhost:11434", "http://127.0.0.1:11434"]
        );
        assert_eq!(
            loopback_variants("http://gpu-box:11434"),
            vec!["http://gpu-box:11434"]
        );
    }

    #[test]
    fn test_union_results_succeeds_if_any_variant_succeeds() {
        let merged = union_results(vec![
            Err(LlmError::Network("down".into())),
            Ok(vec!["a".into()]),
        ])
        .unwrap();
        assert_eq!(merged, vec!["a".to_string()]);
        assert!(union_results(vec![Err(LlmError::Network("down".into()))]).is_err());
    }

    #[tokio::test]
    async fn test_none_provider_is_empty_without_error() {
        let catalog = fetch_models(
            &RelayClient::default(),
            &AppSettings::default().active(),
            &CancellationToken::new(),
        )
        .await;
        assert!(catalog.models.is_empty());
        assert!(catalog.error.is_none());
    }

    #[tokio::test]
    async fn test_openai_models_filtered_and_sorted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .and(header("authorization", format!("Bearer {}", OPENAI_KEY).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    {"id": "whisper-1"},
                    {"id": "gpt-4o-2024-08-06"},
                    {"id": "gpt-4o-mini"},
                    {"id": "gpt-4o-realtime-preview"},
                    {"id": "gpt-4o"},
                    {"id": "o1-mini"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = settings_for(ProviderKind::OpenAI, &server.uri(), OPENAI_KEY);
        let catalog = fetch_models(&RelayClient::default(), &settings, &CancellationToken::new()).await;
        assert_eq!(catalog.error, None);
        assert_eq!(
            catalog.models,
            vec!["gpt-4o-mini", "gpt-4o", "gpt-4o-2024-08-06", "o1-mini"]
        );
    }

    #[tokio::test]
    async fn test_watsonx_specs_filtered_by_vendor_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ml/v1/foundation_model_specs"))
            .and(query_param("version", WATSONX_API_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resources": [
                    {"model_id": "ibm/granite-3-8b-instruct"},
                    {"model_id": "bigscience/mt0-xxl"},
                    {"model_id": "mistralai/mistral-large"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = settings_for(ProviderKind::Watsonx, &server.uri(), "");
        let catalog = fetch_models(&RelayClient::default(), &settings, &CancellationToken::new()).await;
        assert_eq!(catalog.error, None);
        assert_eq!(
            catalog.models,
            vec!["ibm/granite-3-8b-instruct", "mistralai/mistral-large"]
        );
    }

    #[tokio::test]
    async fn test_ollama_tags_listed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "mistral:latest"}, {"name": "llama3.2"}]
            })))
            .mount(&server)
            .await;

        let settings = settings_for(ProviderKind::Ollama, &server.uri(), "");
        let catalog = fetch_models(&RelayClient::default(), &settings, &CancellationToken::new()).await;
        assert_eq!(catalog.error, None);
        assert_eq!(catalog.models, vec!["llama3.2", "mistral:latest"]);
    }

    #[tokio::test]
    async fn test_network_failure_falls_back_for_every_provider() {
        let base = dead_base();
        let keys = [
            (ProviderKind::OpenAI, OPENAI_KEY.to_string()),
            (ProviderKind::Claude, format!("sk-ant-api03-{}", "k".repeat(40))),
            (ProviderKind::Watsonx, String::new()),
            (ProviderKind::Ollama, String::new()),
        ];
        for (kind, key) in keys {
            let settings = settings_for(kind, &base, &key);
            let catalog = fetch_models(&RelayClient::default(), &settings, &CancellationToken::new()).await;
            assert_eq!(catalog.models, fallback_models(kind), "{kind}");
            assert!(catalog.error.is_some(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_missing_key_falls_back_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let settings = settings_for(ProviderKind::Claude, &server.uri(), "");
        let catalog = fetch_models(&RelayClient::default(), &settings, &CancellationToken::new()).await;
        assert_eq!(catalog.models, fallback_models(ProviderKind::Claude));
        assert!(catalog.error.unwrap().contains("API key"));
    }
}
