use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use failure_streaks::config::{Config, StoreBackend};
use failure_streaks::feed::evergreen::EvergreenClient;
use failure_streaks::scan::StreakScanner;
use failure_streaks::store::{ConfiguredStore, MemoryStreakStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env next to the binary first, then fall back to the CWD search.
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match beside_exe {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    tracing::info!(project = %config.project, store = ?config.store.backend, "failure-streaks starting");

    let provider = Arc::new(EvergreenClient::new(&config.evergreen)?);
    let store = Arc::new(open_store(&config)?);
    let scanner = StreakScanner::new(
        provider,
        store,
        config.policy(),
        config.scan.max_concurrent,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after the current commit");
            on_signal.cancel();
        }
    });

    let summary = scanner
        .run(&config.scan, &cancel)
        .await
        .inspect_err(|e| tracing::error!(reason = e.reason(), "scan failed: {e}"))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    tracing::info!("failure-streaks done");
    Ok(())
}

fn open_store(config: &Config) -> anyhow::Result<ConfiguredStore> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store, nothing will be persisted");
            Ok(ConfiguredStore::Memory(MemoryStreakStore::new()))
        }
        #[cfg(feature = "duckdb-store")]
        StoreBackend::Duckdb => Ok(ConfiguredStore::Duckdb(
            failure_streaks::store::DuckDbStreakStore::open(config.store.db_path.clone())?,
        )),
        #[cfg(not(feature = "duckdb-store"))]
        StoreBackend::Duckdb => anyhow::bail!(
            "store.backend = \"duckdb\" requires the duckdb-store feature; use \"memory\""
        ),
    }
}
