use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use marionette::config::OrchestratorConfig;
use marionette::orchestrator::{shutdown_signal, Orchestrator};
use marionette::session::manager::NoopProvisioner;
use marionette::transport::HttpAgentTransport;

#[derive(Parser, Debug)]
#[command(name = "marionette")]
#[command(about = "Dispatch orchestrator for desktop UI-automation agents")]
struct Args {
    /// Address the ingress API listens on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Base port for isolated session allocation
    #[arg(long, default_value = "3390")]
    session_base_port: u16,

    /// Scheduler tick in seconds
    #[arg(long, default_value = "5")]
    tick_seconds: u64,

    /// Job-send timeout in seconds
    #[arg(long, default_value = "10")]
    send_timeout_seconds: u64,

    /// Agent heartbeat timeout in minutes
    #[arg(long, default_value = "5")]
    heartbeat_timeout_minutes: u64,

    /// Session inactivity timeout in hours
    #[arg(long, default_value = "2")]
    session_inactivity_hours: u64,

    /// Jobs per session before recycle
    #[arg(long, default_value = "50")]
    session_max_jobs: u32,

    /// Running-job timeout in minutes
    #[arg(long, default_value = "30")]
    job_timeout_minutes: u64,

    /// Terminal jobs retained in history
    #[arg(long, default_value = "1000")]
    history_max_completed: usize,

    /// Jobs per agent before recycle
    #[arg(long, default_value = "50")]
    recycle_after_jobs: u32,

    /// Consecutive transport failures before a circuit opens
    #[arg(long, default_value = "5")]
    circuit_failures: u32,

    /// Circuit cooldown in seconds
    #[arg(long, default_value = "30")]
    circuit_cooldown_seconds: u64,

    /// Stub agents registered at startup for local demos
    #[arg(long, default_value = "2")]
    default_agent_count: u32,
}

fn build_config(args: &Args) -> Result<OrchestratorConfig, String> {
    let listen_addr: SocketAddr = args
        .listen
        .parse()
        .map_err(|e| format!("invalid listen address {}: {e}", args.listen))?;
    if args.tick_seconds == 0 {
        return Err("tick-seconds must be positive".to_string());
    }
    Ok(OrchestratorConfig {
        listen_addr,
        session_base_port: args.session_base_port,
        scheduler_tick: Duration::from_secs(args.tick_seconds),
        send_timeout: Duration::from_secs(args.send_timeout_seconds),
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_minutes * 60),
        session_inactivity_timeout: Duration::from_secs(args.session_inactivity_hours * 3600),
        session_max_jobs: args.session_max_jobs,
        job_timeout: Duration::from_secs(args.job_timeout_minutes * 60),
        max_completed_history: args.history_max_completed,
        recycle_after_jobs: args.recycle_after_jobs,
        circuit_failure_threshold: args.circuit_failures,
        circuit_cooldown: Duration::from_secs(args.circuit_cooldown_seconds),
        default_agent_count: args.default_agent_count,
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Configuration error");
            return ExitCode::from(2);
        }
    };

    let transport = Arc::new(HttpAgentTransport::new(
        config.send_timeout,
        config.circuit_failure_threshold,
        config.circuit_cooldown,
    ));
    let orchestrator = Orchestrator::new(config.clone(), Arc::new(NoopProvisioner), transport);

    // Pre-register stub agents so the fleet is usable out of the box.
    let state = orchestrator.api_state();
    for i in 0..config.default_agent_count {
        let session = match state.sessions.create(&format!("mario-{i}")).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Startup agent provisioning failed");
                return ExitCode::from(1);
            }
        };
        let endpoint = format!("http://127.0.0.1:{}", session.port);
        let mut agent = marionette::agent::Agent::new(
            format!("agent-{i}"),
            session.id,
            format!("mario-{i}"),
            Default::default(),
            endpoint,
        );
        agent.status = marionette::agent::AgentStatus::Idle;
        agent.last_heartbeat = Some(chrono::Utc::now());
        state.pool.write().await.register(agent);
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });
    tracing::info!(addr = %config.listen_addr, "Starting orchestrator");

    match orchestrator.run(token).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Orchestrator failed");
            ExitCode::from(1)
        }
    }
}
