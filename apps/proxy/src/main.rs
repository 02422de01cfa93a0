use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use nexus_core_sdk::server::{self, RelayConfig};

/**
 * \brief 独立的 CORS 中继进程。环境变量提供默认值，命令行参数优先。
 */
#[derive(Parser, Debug)]
#[command(name = "nexus-proxy", version, about = "CORS relay for Nexus LLM providers")]
struct Args {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /** \brief 逗号分隔的上游 Origin 白名单，覆盖 NEXUS_PROXY_ALLOWLIST */
    #[arg(long)]
    allowlist: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = RelayConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(raw) = args.allowlist {
        let entries: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !entries.is_empty() {
            config.allowlist = entries;
        }
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            trigger.cancel();
        }
    });

    server::run(config, shutdown).await
}
