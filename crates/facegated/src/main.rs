use anyhow::{Context, Result};
use facegate_core::{Config, FaceDb, FACENET_MODEL_VERSION};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod dispatcher;
mod engine;
mod sink;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        api_url = %config.api_url,
        camera = %config.camera_device,
        db = %config.db_path.display(),
        cooldown_secs = config.cooldown_secs,
        recognition_threshold = config.recognition_threshold,
        confidence_threshold = config.confidence_threshold,
        "configuration loaded"
    );

    let store = FaceDb::open(&config.db_path)
        .and_then(|db| db.load(FACENET_MODEL_VERSION))
        .with_context(|| format!("failed to load identities from {}", config.db_path.display()))?;
    if store.is_empty() {
        tracing::warn!("identity store is empty; every face will be reported as unknown");
    }

    let stop = Arc::new(AtomicBool::new(false));
    spawn_stdin_watcher(stop.clone());

    let mut done = engine::spawn_gate(config, store, stop.clone())
        .await
        .context("failed to start gate")?;
    tracing::info!("facegated ready (Ctrl-C or `q` + Enter to stop)");

    let summary = tokio::select! {
        summary = &mut done => summary,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("facegated shutting down");
            stop.store(true, Ordering::Relaxed);
            done.await
        }
    }
    .context("engine thread exited without a summary")?;

    tracing::info!(
        frames = summary.frames,
        dark_frames = summary.dark_frames,
        faces = summary.faces,
        dispatches = summary.dispatches,
        exit = ?summary.exit,
        "facegated stopped"
    );
    Ok(())
}

/// Set `stop` when a line reading `q` arrives on stdin.
fn spawn_stdin_watcher(stop: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("facegate-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().eq_ignore_ascii_case("q") {
                    tracing::info!("stop requested from stdin");
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "stdin watcher unavailable; use Ctrl-C to stop");
    }
}
