use std::sync::Arc;

use anyhow::Result;
use tokio::signal;

use ara_delivery_engine::config::Settings;
use ara_delivery_engine::engine::Engine;
use ara_delivery_engine::intake::RedisIntake;
use ara_delivery_engine::shutdown::GracefulShutdown;
use ara_delivery_engine::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing; keep the guard until exit
    let _telemetry = init_telemetry(&settings.logging, &settings.otel)?;
    tracing::info!("Configuration loaded");

    let engine = Engine::from_settings(settings.clone()).await?;
    let recovered = engine.start().await?;
    tracing::info!(
        requeued = recovered.requeued,
        rescheduled = recovered.rescheduled,
        "Engine running"
    );

    // Start Redis intake in background
    let intake = if settings.intake.enabled {
        let intake = Arc::new(RedisIntake::new(
            settings.intake.clone(),
            settings.redis.url.clone(),
            engine.clone(),
        ));
        let runner = intake.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = runner.start().await {
                tracing::error!(error = %e, "Redis intake failed");
            }
        });
        Some((intake.shutdown_signal(), handle))
    } else {
        tracing::info!("Redis intake disabled");
        None
    };

    wait_for_shutdown_signal().await;

    let mut shutdown = GracefulShutdown::new(engine);
    if let Some((signal, _)) = &intake {
        shutdown = shutdown.with_intake(signal.clone());
    }
    let result = shutdown.execute("signal received").await;

    if let Some((_, handle)) = intake {
        let _ = handle.await;
    }

    if !result.success {
        tracing::warn!("Shutdown finished with unfinished work, it will be recovered on next start");
    }
    tracing::info!("Delivery engine shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
