use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use confsec_host::config::GlobalConfig;
use confsec_host::exec::{CommandRunner, TokioRunner};
use confsec_host::interpreter::SystemInterpreterService;
use confsec_host::ipc::IpcServer;
use confsec_host::router::{ChangeEvent, EventRouter, HostState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("confsec-host daemon starting");

    let cfg = GlobalConfig::load();
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioRunner::new());
    let service = Arc::new(SystemInterpreterService::new(
        runner.clone(),
        cfg.env.invoke_timeout(),
    ));
    let listen_addr = cfg.ipc_listen().to_string();

    let (events_tx, events_rx) = mpsc::channel(64);
    let state = HostState::new(cfg, runner, service, events_tx);

    // Single consumer: activation, then all change events in arrival order
    let router = EventRouter::new(state.clone(), events_rx);
    let router_task = tokio::spawn(router.run());

    // Ctrl+C → serialized shutdown through the event queue
    {
        let events = state.events.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            let _ = events.send(ChangeEvent::ShutdownRequested).await;
        });
    }

    let ipc = IpcServer::new(state.clone(), &listen_addr);
    let ipc_task = tokio::spawn(async move {
        if let Err(e) = ipc.start().await {
            tracing::error!("IPC server error: {}", e);
        }
    });

    // The router finishes only after a shutdown request is fully handled
    let _ = router_task.await;
    ipc_task.abort();
    tracing::info!("confsec-host daemon shut down");
    Ok(())
}
