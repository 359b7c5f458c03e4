//! Change-event routing.
//!
//! External triggers (interpreter changes, configuration edits, explicit
//! restart commands, shutdown) are funneled through one bounded queue and
//! handled by a single consumer task, strictly in arrival order and each to
//! completion. Provisioning and restart steps therefore never interleave:
//! rapid triggers queue up behind the in-flight one instead of preempting
//! it.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::config::{is_relevant_key, GlobalConfig};
use crate::exec::CommandRunner;
use crate::interpreter::{Interpreter, InterpreterResolver, InterpreterService};
use crate::notify::NotificationLog;
use crate::platform::PlatformLayout;
use crate::provision::EnvironmentProvisioner;
use crate::report::ReportCommandHandler;
use crate::session::LanguageClientManager;

/// External triggers consumed by the router. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    InterpreterChanged,
    ConfigurationChanged(String),
    RestartRequested,
    ShutdownRequested,
}

/// Shared wiring of all lifecycle components. The IPC surface reads from it
/// and enqueues events; the router is the only writer of lifecycle state.
pub struct HostState {
    pub config: RwLock<GlobalConfig>,
    pub resolver: InterpreterResolver,
    pub provisioner: Arc<EnvironmentProvisioner>,
    pub manager: LanguageClientManager,
    pub reports: ReportCommandHandler,
    pub notifications: Arc<NotificationLog>,
    pub resolved: Arc<RwLock<Option<Interpreter>>>,
    pub events: mpsc::Sender<ChangeEvent>,
}

impl HostState {
    pub fn new(
        cfg: GlobalConfig,
        runner: Arc<dyn CommandRunner>,
        service: Arc<dyn InterpreterService>,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Arc<Self> {
        let layout = PlatformLayout::current();
        let provisioner = Arc::new(EnvironmentProvisioner::new(runner.clone(), layout, &cfg));
        let resolved = Arc::new(RwLock::new(None));
        let reports = ReportCommandHandler::new(
            runner.clone(),
            provisioner.clone(),
            resolved.clone(),
            cfg.env.invoke_timeout(),
        );
        Arc::new(Self {
            config: RwLock::new(cfg),
            resolver: InterpreterResolver::new(runner.clone(), service),
            provisioner,
            manager: LanguageClientManager::new(runner),
            reports,
            notifications: Arc::new(NotificationLog::new()),
            resolved,
            events,
        })
    }
}

pub struct EventRouter {
    state: Arc<HostState>,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl EventRouter {
    pub fn new(state: Arc<HostState>, rx: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { state, rx }
    }

    /// Activation followed by the serialized event loop. Returns once a
    /// shutdown request has been fully handled.
    pub async fn run(mut self) {
        self.activate().await;

        while let Some(event) = self.rx.recv().await {
            let shutdown = event == ChangeEvent::ShutdownRequested;
            self.handle(event).await;
            if shutdown {
                break;
            }
        }
        tracing::info!("Event router stopped");
    }

    /// Activation: with an explicit interpreter override the server starts
    /// immediately; otherwise host discovery runs first.
    pub async fn activate(&self) {
        let has_override = self.state.config.read().await.server.interpreter.is_some();
        if !has_override {
            tracing::info!("No interpreter override configured, running discovery");
            if let Err(e) = self.state.resolver.service().initialize().await {
                tracing::warn!("Interpreter discovery failed: {}", e);
            }
        }
        self.run_server().await;
    }

    /// Handle one event to completion.
    pub async fn handle(&self, event: ChangeEvent) {
        tracing::debug!("Handling event: {:?}", event);
        match event {
            ChangeEvent::InterpreterChanged | ChangeEvent::RestartRequested => {
                self.run_server().await;
            }
            ChangeEvent::ConfigurationChanged(key) => {
                let reloaded = GlobalConfig::load();
                let relevant = is_relevant_key(&key, &reloaded.server.id);
                *self.state.config.write().await = reloaded;
                if relevant {
                    self.run_server().await;
                } else {
                    tracing::debug!("Ignoring configuration change for '{}'", key);
                }
            }
            ChangeEvent::ShutdownRequested => {
                if let Err(e) = self.state.manager.stop().await {
                    tracing::error!("Error stopping session during shutdown: {}", e);
                }
                self.state
                    .notifications
                    .info("Language server stopped; daemon shutting down")
                    .await;
            }
        }
    }

    /// Resolve → provision → restart. Every failure is surfaced to the user
    /// and leaves the session stopped (or unchanged); the next event retries.
    async fn run_server(&self) {
        let cfg = self.state.config.read().await.clone();

        let interpreter = match self.state.resolver.resolve(&cfg).await {
            Ok(interpreter) => interpreter,
            Err(e) => {
                self.state.notifications.error(e.to_string()).await;
                return;
            }
        };
        *self.state.resolved.write().await = Some(interpreter.clone());

        // Provisioning completes before any start attempt; a failed install
        // never proceeds to a session start.
        let env = match self.state.provisioner.ensure_ready(&interpreter).await {
            Ok(env) => env,
            Err(e) => {
                self.state.notifications.error(e.to_string()).await;
                return;
            }
        };

        match self.state.manager.restart(&env, &cfg.server).await {
            Ok(status) => {
                let pid = status.pid.unwrap_or_default();
                self.state
                    .notifications
                    .info(format!("{} running (pid {})", cfg.server.name, pid))
                    .await;
            }
            Err(e) => {
                self.state.notifications.error(e.to_string()).await;
            }
        }
    }
}
