//! Meeting Mesh simulator
//!
//! Runs several full sessions in one process over an in-memory relay with
//! fake media and transports, waits for the mesh to converge, then leaves.
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment
//! 3. Initialize Prometheus metrics recorder
//! 4. Join every participant, one after another
//! 5. Wait until every pair is connected (or the timeout / Ctrl+C)
//! 6. Send a reaction, log each participant's view and print the metrics
//! 7. Leave every session

#![warn(clippy::pedantic)]

mod config;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use config::SimConfig;
use mesh_core::actors::{
    ConnectionState, SessionActor, SessionDeps, SessionEvent, SessionHandle, SessionParams,
};
use mesh_core::relay::PresenceIdentity;
use mesh_test_utils::{FakeMediaSource, FakeTransportFactory, InMemoryRelayHub};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for each session to leave.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

struct SimParticipant {
    handle: SessionHandle,
    task: JoinHandle<()>,
    event_task: JoinHandle<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let json_logs =
        std::env::var("MESH_SIM_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mesh_sim=info,mesh=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    info!("Starting Meeting Mesh simulator");

    let config = SimConfig::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        participants = config.participants,
        meeting_id = %config.meeting_id,
        converge_timeout_ms = u64::try_from(config.converge_timeout.as_millis()).unwrap_or(u64::MAX),
        json_logs = config.json_logs,
        mesh = ?config.mesh,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")?;
    info!("Prometheus metrics recorder initialized");

    let hub = InMemoryRelayHub::new();
    let shutdown_token = CancellationToken::new();

    let mut participants = Vec::with_capacity(config.participants);
    for n in 1..=config.participants {
        let user_id = format!("user-{n:02}");
        match join_participant(&hub, &config, &user_id, shutdown_token.child_token()).await {
            Ok(participant) => participants.push(participant),
            Err(e) => {
                error!(user_id = %user_id, error = %e, "Participant failed to join");
                leave_all(participants).await;
                return Err(e);
            }
        }
    }
    let joined = u32::try_from(participants.len()).unwrap_or(u32::MAX);
    metrics::gauge!("mesh_sim_participants").set(f64::from(joined));
    info!(count = participants.len(), "All participants joined");

    let converged = tokio::select! {
        converged = wait_for_mesh(&participants, config.converge_timeout) => converged,
        () = shutdown_signal() => {
            info!("Shutdown signal received before the mesh converged");
            false
        }
    };

    if converged {
        info!("Mesh converged, every pair connected");
        if let Some(first) = participants.first() {
            if let Err(e) = first.handle.send_reaction("👋").await {
                warn!(error = %e, "Failed to send reaction");
            }
        }
        // Let the reaction fan out before reporting.
        tokio::time::sleep(Duration::from_millis(50)).await;
    } else {
        warn!("Mesh did not converge");
    }

    report(&participants).await;
    println!("{}", prometheus_handle.render());

    shutdown_token.cancel();
    leave_all(participants).await;

    info!("Meeting Mesh simulator shutdown complete");

    if !converged {
        bail!("mesh did not converge within {:?}", config.converge_timeout);
    }
    Ok(())
}

async fn join_participant(
    hub: &InMemoryRelayHub,
    config: &SimConfig,
    user_id: &str,
    cancel_token: CancellationToken,
) -> anyhow::Result<SimParticipant> {
    let deps = SessionDeps {
        relay: Arc::new(hub.channel(config.meeting_id.clone())),
        media_source: Arc::new(FakeMediaSource::new(user_id)),
        transports: Arc::new(FakeTransportFactory::new(user_id)),
    };
    let params = SessionParams::new(
        PresenceIdentity::new(user_id, format!("Simulated {user_id}")),
        config.mesh.clone(),
    );

    let (handle, events, task) = SessionActor::start(params, deps, cancel_token)
        .await
        .with_context(|| format!("{user_id} could not join"))?;
    info!(user_id = %user_id, "Participant joined");

    let event_task = tokio::spawn(log_events(user_id.to_string(), events));

    Ok(SimParticipant {
        handle,
        task,
        event_task,
    })
}

/// Log UI events for one participant. Returns the number of events seen.
async fn log_events(user_id: String, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> usize {
    let mut seen = 0;
    while let Some(event) = events.recv().await {
        seen += 1;
        match event {
            SessionEvent::ParticipantFailed { user_id: remote, reason } => {
                warn!(user_id = %user_id, remote_user_id = %remote, reason = %reason, "Participant failed");
            }
            SessionEvent::ReactionReceived { from, emoji } => {
                info!(user_id = %user_id, from = %from, emoji = %emoji, "Reaction received");
            }
            other => {
                debug!(user_id = %user_id, event = ?other, "Session event");
            }
        }
    }
    seen
}

/// Poll every session until each sees all others connected.
async fn wait_for_mesh(participants: &[SimParticipant], timeout: Duration) -> bool {
    let expected = participants.len().saturating_sub(1);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let mut all_connected = true;
        for participant in participants {
            let connected = match participant.handle.state().await {
                Ok(state) => state
                    .participants
                    .iter()
                    .filter(|p| p.connection_state == ConnectionState::Connected)
                    .count(),
                Err(_) => 0,
            };
            if connected < expected {
                all_connected = false;
                break;
            }
        }

        if all_connected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn report(participants: &[SimParticipant]) {
    for participant in participants {
        let state = match participant.handle.state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(user_id = %participant.handle.self_id(), error = %e, "State unavailable");
                continue;
            }
        };

        let mut by_state: HashMap<&'static str, usize> = HashMap::new();
        for p in &state.participants {
            *by_state.entry(connection_label(p.connection_state)).or_default() += 1;
        }
        let streams = state.participants.iter().filter(|p| p.stream.is_some()).count();

        info!(
            user_id = %state.self_id,
            meeting_id = %state.meeting_id,
            roster = state.participants.len(),
            links = state.links.len(),
            streams = streams,
            connected = by_state.get("connected").copied().unwrap_or(0),
            failed = by_state.get("failed").copied().unwrap_or(0),
            relay_connected = state.relay_connected,
            "Participant view"
        );
    }
}

fn connection_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Discovered => "discovered",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Failed => "failed",
    }
}

async fn leave_all(participants: Vec<SimParticipant>) {
    for participant in participants {
        let user_id = participant.handle.self_id().to_string();
        match tokio::time::timeout(LEAVE_TIMEOUT, participant.handle.leave()).await {
            Ok(Ok(())) => info!(user_id = %user_id, "Participant left"),
            Ok(Err(e)) => warn!(user_id = %user_id, error = %e, "Leave failed"),
            Err(_) => warn!(user_id = %user_id, "Leave timed out"),
        }

        if let Err(e) = participant.task.await {
            warn!(user_id = %user_id, error = ?e, "Session task panicked");
        }
        match participant.event_task.await {
            Ok(seen) => info!(user_id = %user_id, events = seen, "Event stream closed"),
            Err(e) => warn!(user_id = %user_id, error = ?e, "Event task panicked"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
