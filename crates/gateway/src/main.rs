use anyhow::Context as _;
use clap::Parser;
use manifold_bridge::{Bridge, BridgeConfig};
use std::io::IsTerminal as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

mod management;
mod mcp_http;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI arguments for the gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "manifold-gateway")]
#[command(
    version,
    about = "MCP aggregation gateway: many backend MCP servers behind one catalog"
)]
struct CliArgs {
    /// Path to the gateway config file (YAML).
    #[arg(short = 'c', long = "config", env = "MANIFOLD_CONFIG")]
    config: PathBuf,

    /// MCP data plane bind address (ip:port).
    #[arg(
        short = 'b',
        long,
        env = "MANIFOLD_BIND",
        default_value = "127.0.0.1:8800"
    )]
    bind: String,

    /// Management API bind address (ip:port).
    #[arg(
        long = "management-bind",
        env = "MANIFOLD_MANAGEMENT_BIND",
        default_value = "127.0.0.1:8801"
    )]
    management_bind: String,

    /// Log level. Supports tracing filter syntax.
    #[arg(
        short = 'l',
        long = "log-level",
        env = "MANIFOLD_LOG",
        default_value = "info"
    )]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(&args.log_level);

    tracing::info!("Starting manifold gateway v{VERSION}");
    Box::pin(run(args)).await
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config).await?;

    let ct = CancellationToken::new();
    let bridge =
        Bridge::new(config, ct.clone()).map_err(|e| anyhow::anyhow!("assemble bridge: {e}"))?;

    bridge.start().await;

    let mcp_state = Arc::new(mcp_http::McpState::new(bridge.clone()));
    let mgmt_state = Arc::new(management::ManagementState {
        bridge: bridge.clone(),
        config_path: args.config.clone(),
        management_token: std::env::var("MANIFOLD_MANAGEMENT_TOKEN").ok(),
    });

    let data_bind = parse_socket_addr(&args.bind, "bind")?;
    let mgmt_bind = parse_socket_addr(&args.management_bind, "management-bind")?;

    let data_app = mcp_http::router(mcp_state);
    let mgmt_app = management::router(mgmt_state);

    let (data_listener, _) = bind_and_log(data_bind, "data", "bind").await?;
    let (mgmt_listener, _) = bind_and_log(mgmt_bind, "management", "management-bind").await?;

    spawn_shutdown_watcher(ct.clone());

    serve_servers(ct.clone(), data_listener, data_app, mgmt_listener, mgmt_app).await?;

    bridge.stop().await;
    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

async fn load_config(path: &PathBuf) -> anyhow::Result<BridgeConfig> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: BridgeConfig = serde_yaml::from_slice(&bytes)
        .with_context(|| format!("parse YAML config: {}", path.display()))?;
    manifold_bridge::config::validate(&cfg)
        .map_err(|e| anyhow::anyhow!("validate config {}: {e}", path.display()))?;
    Ok(cfg)
}

fn parse_socket_addr(value: &str, name: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("invalid {name} address '{value}'"))
}

async fn bind_and_log(
    addr: SocketAddr,
    label: &'static str,
    name: &'static str,
) -> anyhow::Result<(tokio::net::TcpListener, SocketAddr)> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {name} address '{addr}'"))?;
    let bound = listener
        .local_addr()
        .with_context(|| format!("get {name} bind address"))?;
    tracing::info!("Starting {label} plane HTTP server on {bound}");
    Ok((listener, bound))
}

fn spawn_shutdown_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                }
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            () = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        ct.cancel();
    });
}

async fn serve_servers(
    ct: CancellationToken,
    data_listener: tokio::net::TcpListener,
    data_app: axum::Router,
    mgmt_listener: tokio::net::TcpListener,
    mgmt_app: axum::Router,
) -> anyhow::Result<()> {
    let data_ct = ct.clone();
    let data_server = axum::serve(
        data_listener,
        data_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        data_ct.cancelled().await;
    });

    let mgmt_ct = ct.clone();
    let mgmt_server = axum::serve(mgmt_listener, mgmt_app).with_graceful_shutdown(async move {
        mgmt_ct.cancelled().await;
    });

    tokio::try_join!(data_server, mgmt_server)?;
    Ok(())
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if std::io::stdout().is_terminal() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_config_parses_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        tokio::fs::write(
            &path,
            r#"
backends:
  - name: gh
    transport: stdio
    connect:
      command: gh-mcp-server
      args: ["--stdio"]
  - name: docs
    transport: sse
    connect:
      url: https://docs.example.com/sse
    filters:
      tools:
        allow: ["search_*"]
        deny: ["search_internal"]
conflictResolution:
  strategy: prefix
  separator: "_"
incomingAuth:
  type: anonymous
authorization:
  enabled: false
audit:
  enabled: true
"#,
        )
        .await
        .unwrap();

        let cfg = load_config(&path).await.unwrap();
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends[0].name, "gh");
        assert_eq!(cfg.backends[1].transport.kind(), "sse");
        assert_eq!(
            cfg.conflict_resolution.strategy,
            manifold_bridge::config::ConflictStrategy::Prefix
        );
    }

    #[tokio::test]
    async fn load_config_rejects_manual_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        tokio::fs::write(
            &path,
            "backends: []\nconflictResolution:\n  strategy: manual\n",
        )
        .await
        .unwrap();

        assert!(load_config(&path).await.is_err());
    }

    #[tokio::test]
    async fn load_config_rejects_duplicate_backends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.yaml");
        tokio::fs::write(
            &path,
            r#"
backends:
  - name: gh
    transport: stdio
    connect: { command: a }
  - name: gh
    transport: stdio
    connect: { command: b }
"#,
        )
        .await
        .unwrap();

        assert!(load_config(&path).await.is_err());
    }
}
