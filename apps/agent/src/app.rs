//! Application orchestrator: wires the agent's components together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bundlestore_agent_connection::{
    Callback, ConnectionState, ConnectionStatus, PeriodicConnectionChecker, TcpProbe,
};
use bundlestore_bundle_io::BundleIoRegistry;
use bundlestore_data_channel::StorageServer;
use bundlestore_transfer::DataTransferService;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Everything the agent's services share, built once at startup.
pub struct AgentContext {
    pub agent_id: String,
    pub config: Config,
    pub registry: Arc<BundleIoRegistry>,
    pub transfers: DataTransferService,
    registered: AtomicBool,
}

impl AgentContext {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(BundleIoRegistry::with_defaults());
        let transfers = DataTransferService::new(registry.clone(), config.transfer_config());
        Self {
            agent_id: uuid::Uuid::new_v4().to_string(),
            config,
            registry,
            transfers,
            registered: AtomicBool::new(false),
        }
    }

    /// Whether the master answered the most recent liveness check.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }
}

/// A started agent. Call [`RunningAgent::shutdown`] to stop it.
pub struct RunningAgent {
    pub context: Arc<AgentContext>,
    pub local_addr: SocketAddr,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    checker: Option<PeriodicConnectionChecker<String>>,
}

impl RunningAgent {
    pub async fn start(context: Arc<AgentContext>) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();

        let server = StorageServer::new(context.transfers.clone(), cancel.clone());
        let listener = server.bind(&context.config.server_config()).await?;
        let local_addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!("storage server error: {e}");
            }
        });

        let checker = context
            .config
            .master_addr
            .clone()
            .map(|master| start_checker(&context, master));

        Ok(Self {
            context,
            local_addr,
            cancel,
            server,
            checker,
        })
    }

    /// Stops the checker and the server, waiting for the accept loop to exit.
    pub async fn shutdown(mut self) {
        tracing::info!("stopping services...");
        if let Some(checker) = self.checker.as_mut() {
            checker.dispose();
        }
        self.cancel.cancel();
        if let Err(e) = (&mut self.server).await {
            tracing::warn!("server task ended abnormally: {e}");
        }
    }
}

/// The agent starts unregistered, so the first successful probe reports a
/// recovery and marks it registered.
fn start_checker(context: &Arc<AgentContext>, master: String) -> PeriodicConnectionChecker<String> {
    let config = context.config.checker_config();
    let mut checker =
        PeriodicConnectionChecker::new(ConnectionState::new(ConnectionStatus::Open), config);

    let ctx = context.clone();
    let on_success: Callback<String> = Arc::new(move |master: &String| {
        tracing::info!(%master, "master reachable, agent registered");
        ctx.set_registered(true);
    });
    let ctx = context.clone();
    let on_failure: Callback<String> = Arc::new(move |master: &String| {
        tracing::warn!(%master, "master unreachable, agent unregistered");
        ctx.set_registered(false);
    });

    let probe = Arc::new(TcpProbe::new(context.config.probe_timeout()));
    checker.initialize(master, probe, Some(on_success), Some(on_failure));
    checker
}

/// Runs the agent until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let context = Arc::new(AgentContext::new(config));
    let agent = RunningAgent::start(context).await?;
    tracing::info!(
        agent_id = %agent.context.agent_id,
        name = %agent.context.config.name,
        addr = %agent.local_addr,
        "agent ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        registered = agent.context.is_registered(),
        "SIGINT received, shutting down"
    );

    agent.shutdown().await;
    Ok(())
}
