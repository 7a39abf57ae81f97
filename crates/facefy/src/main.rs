mod bootstrap;
mod console;

use std::sync::Arc;

use anyhow::Result;
use facefy_core::preferences::{FilePreferenceStore, PREFERENCE_SCOPE};
use facefy_core::settings::Settings;
use facefy_runtime::aggregator::Aggregator;
use facefy_runtime::session::{ReconnectPolicy, SessionConfig};

fn session_config(settings: &Settings) -> SessionConfig {
    SessionConfig {
        connect_timeout: settings.connect_timeout(),
        reconnect: ReconnectPolicy {
            max_attempts: settings.reconnect_attempts,
            initial_backoff: settings.reconnect_backoff(),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load();
    let prefs_dir = settings.prefs_dir();

    bootstrap::ensure_directories(&prefs_dir)?;
    bootstrap::setup_logging(&settings.log_level, settings.log_file.as_ref())?;

    tracing::info!("Facefy v{} starting", env!("CARGO_PKG_VERSION"));

    let store = FilePreferenceStore::open(&prefs_dir, PREFERENCE_SCOPE);
    if settings.clear {
        store.clear()?;
        tracing::info!(path = %store.path().display(), "saved preferences cleared");
    }

    let aggregator = Arc::new(Aggregator::new(Arc::new(store), session_config(&settings)));

    if let Some(endpoint) = settings.endpoint_override(&aggregator.endpoint())? {
        aggregator.update_endpoint(endpoint.host(), u32::from(endpoint.port()))?;
    }
    tracing::info!("Server: {}", aggregator.endpoint().uri());

    let renderer = tokio::spawn(console::render_updates(
        Arc::clone(&aggregator),
        settings.stream,
    ));

    if settings.connect {
        aggregator.connect();
    } else {
        println!("{}", console::HELP);
    }

    tokio::select! {
        result = console::run(Arc::clone(&aggregator)) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received; shutting down");
        }
    }

    renderer.abort();
    aggregator.disconnect();

    Ok(())
}
