use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use ara_realtime_gateway::config::Settings;
use ara_realtime_gateway::server::{create_app, AppState};
use ara_realtime_gateway::tasks::PresenceHeartbeatTask;
use ara_realtime_gateway::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (and OTLP export when enabled)
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings.clone());

    // Cluster bus subscriber loop
    let bus_handle = state.redis_bus.clone().map(|bus| {
        let shutdown_rx = state.shutdown.subscribe();
        tokio::spawn(bus.run(shutdown_rx))
    });

    // Presence refresh and stale connection sweep
    let heartbeat_task = PresenceHeartbeatTask::new(
        state.registry.clone(),
        state.presence.clone(),
        settings.transport.ping_interval(),
        settings.transport.ping_interval() + settings.transport.ping_timeout(),
        state.shutdown.subscribe(),
    );
    let heartbeat_handle = tokio::spawn(heartbeat_task.run());

    // Create Axum app
    let app = create_app(state.clone());

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(state.clone()))
        .await?;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = heartbeat_handle.await;
    if let Some(handle) = bus_handle {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    tracing::info!(signal = reason, "Received shutdown signal, draining connections");

    // Notify, wait the grace window and close sockets before axum stops
    let result = state.shutdown.execute(reason).await;
    if !result.success {
        tracing::warn!(
            connections_closed = result.connections_closed,
            "Shutdown finished with connections still open"
        );
    }
}
