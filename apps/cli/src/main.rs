use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use nexus_core_sdk::{
    db,
    llm::{LlmManager, ManagerConfig, ModeObserver},
    models::{AppSettings, AvatarMode, ProviderKind},
    server::{self, RelayConfig},
    settings::{ProviderPatch, RelayPatch, SettingsPatch, SettingsStore},
    telemetry,
};

/**
 * \brief CLI 程序入口：管理设置、单轮对话、查看模型、启动中继。
 */
#[derive(Parser, Debug)]
#[command(name = "nexus", version, about = "Nexus avatar LLM router")]
struct Cli {
    /** \brief 设置数据库路径 */
    #[arg(long, global = true, env = "NEXUS_DB")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 查看或修改设置。
     */
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /**
     * \brief 发送一条消息并打印回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        /** \brief 临时覆盖当前 Provider */
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /**
     * \brief 列出 Provider 的可用模型。
     */
    Models {
        #[arg(long)]
        provider: Option<String>,
    },

    /**
     * \brief 启动 CORS 中继。
     */
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /** \brief 打印当前设置（Key 已脱敏） */
    Show,
    /** \brief 修改设置，未给出的字段保持不变 */
    Set {
        /** \brief 激活的 Provider：none/openai/claude/watsonx/ollama */
        #[arg(long)]
        provider: Option<String>,
        /** \brief 要修改哪个 Provider 的子配置，默认取 --provider 或当前 Provider */
        #[arg(long = "for")]
        target: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        project_id: Option<String>,
        #[arg(long)]
        system_prompt: Option<String>,
        #[arg(long)]
        relay: Option<bool>,
        #[arg(long)]
        relay_url: Option<String>,
        #[arg(long)]
        telemetry: Option<bool>,
    },
}

/** \brief 把头像状态变化打到日志里。 */
struct LogObserver;

impl ModeObserver for LogObserver {
    fn on_mode(&self, mode: AvatarMode) {
        tracing::debug!(?mode, "avatar mode");
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_provider(raw: &str) -> Result<ProviderKind> {
    ProviderKind::parse(raw).with_context(|| {
        format!(
            "unknown provider \"{}\", expected one of: none, openai, claude, watsonx, ollama",
            raw
        )
    })
}

/**
 * \brief 脱敏显示密钥：只保留前 6 位。
 */
fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let head: String = secret.chars().take(6).collect();
    format!("{}…({} chars)", head, secret.chars().count())
}

fn masked(settings: &AppSettings) -> AppSettings {
    let mut out = settings.clone();
    for kind in ProviderKind::NETWORKED {
        if let Some(cfg) = out.provider_config_mut(kind) {
            cfg.api_key = mask_secret(&cfg.api_key);
        }
    }
    out
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let backend = match &cli.db {
        Some(path) => db::SqliteBackend::open(path),
        None => db::SqliteBackend::open_default(),
    }
    .context("open settings database failed")?;
    telemetry::set_enabled(backend.telemetry_enabled());
    let store = SettingsStore::load(Box::new(backend));

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let snapshot = masked(&store.snapshot());
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            ConfigAction::Set {
                provider,
                target,
                api_key,
                model,
                base_url,
                project_id,
                system_prompt,
                relay,
                relay_url,
                telemetry: telemetry_flag,
            } => {
                let target = match target.as_deref().or(provider.as_deref()) {
                    Some(raw) => parse_provider(raw)?,
                    None => store.snapshot().provider,
                };
                if let Some(raw) = &provider {
                    parse_provider(raw)?;
                }

                let provider_patch = ProviderPatch {
                    api_key,
                    model,
                    base_url,
                    project_id,
                };
                let touches_provider = provider_patch != ProviderPatch::default();
                if touches_provider && target == ProviderKind::None {
                    bail!("offline mode has no provider settings; pass --for <provider>");
                }

                let mut patch = SettingsPatch::for_provider(target, provider_patch);
                patch.provider = provider;
                patch.system_prompt = system_prompt;
                if relay.is_some() || relay_url.is_some() {
                    patch.relay = Some(RelayPatch {
                        enabled: relay,
                        relay_url,
                    });
                }
                let updated = store.update(patch);

                if let Some(enabled) = telemetry_flag {
                    let conn = match &cli.db {
                        Some(path) => db::open_db(path),
                        None => db::open_default_db(),
                    }
                    .context("open settings database failed")?;
                    db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
                    telemetry::set_enabled(enabled);
                }
                println!("{}", serde_json::to_string_pretty(&masked(&updated))?);
            }
        },
        Commands::Chat {
            prompt,
            provider,
            timeout_secs,
        } => {
            let app = store.snapshot();
            let settings = match provider.as_deref() {
                Some(raw) => app.resolve(parse_provider(raw)?),
                None => app.active(),
            };
            let manager = LlmManager::new(ManagerConfig {
                timeout: Duration::from_secs(timeout_secs.max(1)),
                ..ManagerConfig::default()
            })
            .with_observer(Arc::new(LogObserver));

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "provider={} prompt_len={}",
                    settings.provider,
                    prompt.len()
                ),
            );
            let cancel = cancel_on_ctrl_c();
            let reply = manager
                .send(&settings, &prompt, &settings.system_prompt, &[], &cancel)
                .await
                .context("chat failed")?;
            println!("{}", reply);
        }
        Commands::Models { provider } => {
            let app = store.snapshot();
            let settings = match provider.as_deref() {
                Some(raw) => app.resolve(parse_provider(raw)?),
                None => app.active(),
            };
            let manager = LlmManager::default();
            let catalog = manager.fetch_models(&settings, &cancel_on_ctrl_c()).await;
            if let Some(err) = &catalog.error {
                eprintln!("warning: showing built-in list ({})", err);
            }
            for model in catalog.models {
                println!("{}", model);
            }
        }
        Commands::Serve { host, port } => {
            let mut config = RelayConfig::from_env();
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            server::run(config, cancel_on_ctrl_c()).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "");
        assert_eq!(mask_secret("sk-abcdefghij"), "sk-abc…(13 chars)");
    }

    #[test]
    fn test_cli_parses_config_set() {
        let cli = Cli::try_parse_from([
            "nexus", "config", "set", "--provider", "openai", "--api-key", "sk-x", "--relay", "true",
        ])
        .unwrap();
        match cli.command {
            Commands::Config {
                action: ConfigAction::Set { provider, api_key, relay, .. },
            } => {
                assert_eq!(provider.as_deref(), Some("openai"));
                assert_eq!(api_key.as_deref(), Some("sk-x"));
                assert_eq!(relay, Some(true));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_provider_rejects_unknown() {
        assert!(parse_provider("gemini").is_err());
        assert_eq!(parse_provider("Claude").unwrap(), ProviderKind::Claude);
    }
}
