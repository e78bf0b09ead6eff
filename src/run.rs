use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

use crate::backend::BackendClient;
use crate::chat::ChatRunner;
use crate::config::Config;
use crate::gateway::{ClientIdentity, GatewayClient};
use crate::identity::{DeviceIdentity, FileDeviceIdentity};
use crate::ingress::{self, HealthStatus, PushServerConfig};
use crate::processor::Processor;
use crate::queue::BoundedQueue;
use crate::resilience::BackoffSchedule;
use crate::transcription;
use crate::types::InboundMessage;

const CHAT_SEND_ATTEMPTS: usize = 3;

/// Wires config into every collaborator and runs the daemon until a shutdown
/// signal arrives, then drains in flight work before returning.
pub async fn run(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.openclaw_state_dir)
        .with_context(|| format!("failed to create state dir {}", config.openclaw_state_dir.display()))?;

    let device = Arc::new(
        FileDeviceIdentity::load_or_create(&config.openclaw_state_dir).context("failed to load or create device identity")?,
    );

    let identity = ClientIdentity {
        client_id: device.device_id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
        mode: "relay".to_string(),
        instance_id: config.relay_instance_id.clone(),
        role: "relay".to_string(),
        scopes: config.openclaw_scopes.clone(),
        caps: vec!["chat.send".to_string(), "chat.abort".to_string(), "session.new".to_string()],
        token: config.openclaw_gateway_token.clone(),
        password: config.openclaw_gateway_password.clone(),
    };

    let gateway = GatewayClient::new(config.gateway_ws_url.clone(), identity, device);
    gateway.start().await.context("failed to connect to agent gateway")?;

    let transcription_provider = transcription::provider_from_env(
        config.transcription.provider.as_deref(),
        config.transcription.api_key.as_deref(),
        config.transcription.model.as_deref(),
        config.transcription.language.as_deref(),
    );

    let runner = ChatRunner::new(
        gateway.clone(),
        BackoffSchedule::default_chat(),
        CHAT_SEND_ATTEMPTS,
        config.openclaw_state_dir.clone(),
        transcription_provider,
        config.message_flow_log,
    );

    let backend = Arc::new(BackendClient::new(config.backend_base_url.clone(), config.relay_token.clone()));

    let processor = Arc::new(Processor {
        runner,
        gateway: gateway.clone(),
        backend,
        relay_instance_id: config.relay_instance_id.clone(),
        task_timeout_ms: config.task_timeout_ms,
        state_dir: config.openclaw_state_dir.clone(),
        message_flow_log: config.message_flow_log,
    });

    let queue: Arc<BoundedQueue<InboundMessage>> = Arc::new(BoundedQueue::start(config.concurrency, config.push_max_queue, {
        let processor = Arc::clone(&processor);
        move |message: InboundMessage| {
            let processor = Arc::clone(&processor);
            async move { processor.process(message).await }
        }
    }));

    let shutting_down = Arc::new(AtomicBool::new(false));
    let health = {
        let gateway = gateway.clone();
        let queue = Arc::clone(&queue);
        let shutting_down = Arc::clone(&shutting_down);
        Arc::new(move || {
            let state = queue.get_state();
            let ready = gateway.is_ready() && state.accepting && !shutting_down.load(Ordering::Relaxed);
            HealthStatus {
                ok: true,
                ready,
                details: serde_json::json!({
                    "gatewayReady": gateway.is_ready(),
                    "queueLength": state.queue_length,
                    "inFlight": state.in_flight,
                    "shuttingDown": shutting_down.load(Ordering::Relaxed),
                }),
            }
        })
    };

    let router = ingress::build_router(
        PushServerConfig {
            token: config.relay_token.clone(),
            push_path: config.push_path.clone(),
            rate_limit_per_second: config.push_rate_limit_per_sec,
            max_concurrent_requests: config.push_max_concurrent_requests,
            message_flow_log: config.message_flow_log,
        },
        Arc::clone(&queue),
        health,
    );

    let shutdown_notify = Arc::new(Notify::new());
    let server_handle = tokio::spawn(ingress::serve(router, config.push_port, {
        let notify = Arc::clone(&shutdown_notify);
        async move { notify.notified().await }
    }));

    wait_for_shutdown_signal().await?;
    tracing::info!("shutdown signal received, draining in-flight work");
    shutting_down.store(true, Ordering::Relaxed);
    shutdown_notify.notify_one();

    if let Err(e) = server_handle.await.context("push server task panicked")? {
        tracing::error!(error = %e, "push server exited with an error during shutdown");
    }

    let drain_deadline = Duration::from_secs(15).max(Duration::from_millis(config.task_timeout_ms) * 2);
    queue.stop_accepting();
    if !queue.drain(drain_deadline).await {
        tracing::warn!(deadline_secs = drain_deadline.as_secs(), "queue did not drain before the deadline");
    }
    gateway.stop().await;

    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}
