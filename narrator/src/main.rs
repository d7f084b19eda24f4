mod capture;
mod capture_loop;
mod detection;
mod filter;
mod speech;
mod stop;

use capture_loop::{LoopState, Narrator};
use detection::coordinator::RequestCoordinator;
use scene_narrator_common::config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        provider = config.detection.provider.as_str(),
        update_interval_ms = config.detection.update_interval_ms,
        change_threshold = config.detection.change_threshold,
        max_concurrent_requests = config.detection.max_concurrent_requests,
        camera = ?config.camera.source,
        fps = config.camera.fps,
        speech = config.speech.enabled,
        "starting scene narrator"
    );

    let resolved = match config.resolve_provider() {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "no usable detection provider");
            std::process::exit(1);
        }
    };

    let provider = match detection::build_provider(
        &resolved,
        Duration::from_secs(config.detection.request_timeout_secs),
    ) {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to build detection provider");
            std::process::exit(1);
        }
    };

    let coordinator = Arc::new(RequestCoordinator::new(
        Arc::new(provider),
        config.detection.max_concurrent_requests,
    ));
    let sink = speech::build_sink(&config.speech).await;

    let mut source = match capture::build_source(&config.camera) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to build capture source");
            std::process::exit(1);
        }
    };
    if let Err(e) = source.open().await {
        error!(error = %e, "Unable to access the camera");
        std::process::exit(1);
    }

    let narrator = Narrator::new(
        coordinator,
        sink,
        config.detection.update_interval_ms,
        config.camera.jpeg_quality,
    );

    println!("Press 'q' then Enter, or Ctrl-C, to stop");
    let mut stop = stop::listen();
    narrator
        .run(
            source.as_mut(),
            LoopState::new(config.detection.change_threshold),
            &mut stop,
            config.camera.fps,
        )
        .await;

    info!("scene narrator stopped");
}
