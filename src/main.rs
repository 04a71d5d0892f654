use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use binlog_relay::{Flavor, MasterConfig, Relay, RelayConfig};

#[derive(Parser)]
#[command(name = "binlog-relay")]
#[command(about = "Relays a MySQL master's binlog stream into local relay log files")]
struct Cli {
    /// Server id this relay presents to the master; must differ from the
    /// master's own server_id
    #[arg(long)]
    server_id: u32,

    /// Upstream flavor: mysql or mariadb
    #[arg(long, default_value = "mysql")]
    flavor: Flavor,

    /// Master host
    #[arg(long, default_value = "localhost", env = "RELAY_MASTER_HOST")]
    host: String,

    /// Master port
    #[arg(long, default_value = "3306", env = "RELAY_MASTER_PORT")]
    port: u16,

    /// Replication user
    #[arg(long, default_value = "root", env = "RELAY_MASTER_USER")]
    user: String,

    /// Replication password
    #[arg(long, default_value = "", env = "RELAY_MASTER_PASSWORD")]
    password: String,

    /// Connection charset
    #[arg(long, default_value = "utf8mb4")]
    charset: String,

    /// Track GTID sets and start dumps by GTID
    #[arg(long)]
    enable_gtid: bool,

    /// Allow a one-shot GTID resync when the master reports purged binlogs
    #[arg(long)]
    auto_fix_gtid: bool,

    /// Root directory for relay log files
    #[arg(long, default_value = "relay-logs")]
    relay_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = RelayConfig {
        server_id: cli.server_id,
        flavor: cli.flavor,
        from: MasterConfig {
            host: cli.host,
            port: cli.port,
            user: cli.user,
            password: cli.password,
        },
        charset: cli.charset,
        enable_gtid: cli.enable_gtid,
        auto_fix_gtid: cli.auto_fix_gtid,
        relay_dir: cli.relay_dir,
    };

    let mut relay = Relay::new(&config);
    relay.init().await?;
    tracing::info!(
        "relay started for master {} into {}",
        config.from.node(),
        config.relay_dir.display()
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            signal_token.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(1);
    relay.process(shutdown, tx).await;
    relay.close().await;

    let result = rx.recv().await.unwrap_or_default();
    if result.is_canceled {
        tracing::info!("relay canceled");
    }
    for error in &result.errors {
        tracing::error!("relay error: {}", error.message);
    }
    if !result.errors.is_empty() {
        anyhow::bail!("relay exited with {} error(s)", result.errors.len());
    }
    Ok(())
}
