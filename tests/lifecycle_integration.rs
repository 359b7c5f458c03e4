//! End-to-end lifecycle scenarios driven through the event router, with all
//! process side effects scripted so no real Python is required.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::mpsc;
use tower::ServiceExt;

use confsec_host::config::GlobalConfig;
use confsec_host::exec::{CommandRunner, CommandSpec, ExecError, ExecOutput};
use confsec_host::interpreter::InterpreterService;
use confsec_host::platform::PlatformLayout;
use confsec_host::provision::{EnvStatus, REQUIRED_PACKAGES};
use confsec_host::router::{ChangeEvent, EventRouter, HostState};
use confsec_host::session::server_process::{ServerHandle, SpawnOptions};

// ── scripted world ───────────────────────────────────────────

#[derive(Default)]
struct World {
    installed: BTreeSet<String>,
    venv_calls: usize,
    install_calls: Vec<Vec<String>>,
    report_calls: Vec<String>,
    fail_install: bool,
    fail_spawn: bool,
    report_exit: i32,
    report_stderr: String,
    report_writes_file: bool,
    /// Session lifecycle events in the order they happened.
    lifecycle: Vec<&'static str>,
    active_sessions: usize,
    peak_sessions: usize,
}

/// Simulates the interpreter, venv, pip, the report tool and the server
/// process against a real temp directory.
struct ScriptedRunner {
    world: Arc<StdMutex<World>>,
    root: PathBuf,
    layout: PlatformLayout,
}

impl ScriptedRunner {
    fn new(root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            world: Arc::new(StdMutex::new(World {
                report_writes_file: true,
                ..World::default()
            })),
            root,
            layout: PlatformLayout::current(),
        })
    }

    fn materialize_env(&self) {
        let python = self.layout.venv_python(&self.root);
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::fs::write(&python, b"").unwrap();
    }

    fn seed_installed(&self, packages: &[&str]) {
        let mut world = self.world.lock().unwrap();
        world.installed = packages.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec, _timeout: Duration) -> Result<ExecOutput, ExecError> {
        let args: Vec<&str> = spec.args.iter().map(|s| s.as_str()).collect();
        let mut world = self.world.lock().unwrap();
        match args.as_slice() {
            ["--version"] => Ok(ExecOutput {
                status_code: Some(0),
                stdout: "Python 3.11.4\n".into(),
                stderr: String::new(),
            }),
            ["-m", "venv", _root] => {
                world.venv_calls += 1;
                drop(world);
                self.materialize_env();
                Ok(ExecOutput {
                    status_code: Some(0),
                    ..Default::default()
                })
            }
            ["-m", "pip", "freeze"] => {
                let stdout = world
                    .installed
                    .iter()
                    .map(|name| format!("{}==1.0\n", name))
                    .collect();
                Ok(ExecOutput {
                    status_code: Some(0),
                    stdout,
                    stderr: String::new(),
                })
            }
            ["-m", "pip", "install", packages @ ..] => {
                let packages: Vec<String> = packages.iter().map(|s| s.to_string()).collect();
                world.install_calls.push(packages.clone());
                if world.fail_install {
                    return Ok(ExecOutput {
                        status_code: Some(1),
                        stdout: String::new(),
                        stderr: "ERROR: No matching distribution found for xhtml2pdf".into(),
                    });
                }
                world.installed.extend(packages);
                Ok(ExecOutput {
                    status_code: Some(0),
                    ..Default::default()
                })
            }
            ["-m", _report_module, rest @ ..] => {
                world.report_calls.push(spec.display());
                let exit = world.report_exit;
                let stderr = world.report_stderr.clone();
                let write_file = world.report_writes_file && exit == 0;
                drop(world);
                if write_file {
                    let out_dir = rest
                        .iter()
                        .find_map(|a| a.strip_prefix("--pdf-output="))
                        .expect("report invocation carries --pdf-output");
                    std::fs::write(Path::new(out_dir).join("report.pdf"), b"%PDF-1.4").unwrap();
                }
                Ok(ExecOutput {
                    status_code: Some(exit),
                    stdout: String::new(),
                    stderr,
                })
            }
            _ => Ok(ExecOutput {
                status_code: Some(0),
                ..Default::default()
            }),
        }
    }

    async fn spawn_server(
        &self,
        spec: &CommandSpec,
        _opts: &SpawnOptions,
    ) -> Result<Box<dyn ServerHandle>, ExecError> {
        let mut world = self.world.lock().unwrap();
        if world.fail_spawn {
            return Err(ExecError::Spawn {
                program: spec.program.to_string_lossy().into_owned(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "spawn refused"),
            });
        }
        world.active_sessions += 1;
        world.peak_sessions = world.peak_sessions.max(world.active_sessions);
        world.lifecycle.push("start");
        Ok(Box::new(ScriptedHandle {
            world: self.world.clone(),
            running: AtomicBool::new(true),
        }))
    }
}

struct ScriptedHandle {
    world: Arc<StdMutex<World>>,
    running: AtomicBool,
}

#[async_trait]
impl ServerHandle for ScriptedHandle {
    fn pid(&self) -> u32 {
        4242
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn send_message(&self, _framed: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> anyhow::Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            let mut world = self.world.lock().unwrap();
            world.active_sessions -= 1;
            world.lifecycle.push("stop");
        }
        Ok(())
    }
}

/// Host discovery backend that never finds anything; the scenarios below use
/// the explicit interpreter override path unless stated otherwise.
struct NoDiscovery;

#[async_trait]
impl InterpreterService for NoDiscovery {
    async fn active_interpreter(&self) -> Option<PathBuf> {
        None
    }
}

// ── harness ──────────────────────────────────────────────────

struct Harness {
    state: Arc<HostState>,
    router: EventRouter,
    runner: Arc<ScriptedRunner>,
    _data_dir: tempfile::TempDir,
}

fn harness(configure: impl FnOnce(&mut GlobalConfig)) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let root = data_dir.path().join("venv");

    let mut cfg = GlobalConfig::default();
    cfg.env.root = Some(root.to_string_lossy().into_owned());
    cfg.server.interpreter = Some("/usr/bin/python3".to_string());
    configure(&mut cfg);

    let runner = ScriptedRunner::new(root);
    let (events_tx, events_rx) = mpsc::channel(64);
    let state = HostState::new(
        cfg,
        runner.clone() as Arc<dyn CommandRunner>,
        Arc::new(NoDiscovery),
        events_tx,
    );
    let router = EventRouter::new(state.clone(), events_rx);
    Harness {
        state,
        router,
        runner,
        _data_dir: data_dir,
    }
}

fn lifecycle(h: &Harness) -> Vec<&'static str> {
    h.runner.world.lock().unwrap().lifecycle.clone()
}

// ── scenarios ────────────────────────────────────────────────

/// Scenario A: fresh activation, no environment present, valid interpreter
/// configured → environment created, full package set installed, session
/// ends up running, no report invocation happened.
#[tokio::test]
async fn scenario_a_fresh_activation_provisions_and_starts() {
    let h = harness(|_| {});
    h.router.activate().await;

    {
        let world = h.runner.world.lock().unwrap();
        assert_eq!(world.venv_calls, 1);
        assert_eq!(
            world.install_calls,
            vec![REQUIRED_PACKAGES
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()]
        );
        assert_eq!(world.lifecycle, vec!["start"]);
        assert!(world.report_calls.is_empty());
    }

    assert_eq!(h.state.manager.status().await.state, "running");
    assert_eq!(h.state.provisioner.status().await.unwrap(), EnvStatus::Ready);
    let notes = h.state.notifications.recent(10).await;
    assert!(notes.iter().any(|n| n.message.contains("running")));
}

/// Scenario B: environment already complete → no venv creation, no install
/// invocation at all, session still starts.
#[tokio::test]
async fn scenario_b_ready_environment_skips_install() {
    let h = harness(|_| {});
    h.runner.materialize_env();
    h.runner.seed_installed(&REQUIRED_PACKAGES);

    h.router.activate().await;

    let world = h.runner.world.lock().unwrap();
    assert_eq!(world.venv_calls, 0);
    assert!(world.install_calls.is_empty());
    assert_eq!(world.lifecycle, vec!["start"]);
}

/// Scenario C: one required package missing → exactly one batched install
/// call naming only the missing package.
#[tokio::test]
async fn scenario_c_repair_installs_only_missing() {
    let h = harness(|_| {});
    h.runner.materialize_env();
    h.runner.seed_installed(&["crossplane", "jinja2", "pygls"]);

    h.router.activate().await;

    let world = h.runner.world.lock().unwrap();
    assert_eq!(world.venv_calls, 0);
    assert_eq!(world.install_calls, vec![vec!["xhtml2pdf".to_string()]]);
    assert_eq!(world.lifecycle, vec!["start"]);
}

/// Scenario D: report generation against `foo.conf` with a workspace root →
/// invocation targets `<ws>/output/confsec/`; on non-zero exit the failure
/// notification carries the captured stderr, and the session is untouched.
#[tokio::test]
async fn scenario_d_report_failure_surfaces_stderr() {
    let h = harness(|_| {});
    h.router.activate().await;
    assert_eq!(h.state.manager.status().await.state, "running");

    {
        let mut world = h.runner.world.lock().unwrap();
        world.report_exit = 2;
        world.report_stderr = "crossplane parse error: unexpected token".into();
    }

    let workspace = tempfile::tempdir().unwrap();
    let app = confsec_host::ipc::build_router(h.state.clone());
    let body = serde_json::json!({
        "document_path": "foo.conf",
        "workspace_root": workspace.path(),
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/report")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["error_code"], "REPORT_GENERATION_FAILED");
    assert!(payload["error"]
        .as_str()
        .unwrap()
        .contains("crossplane parse error"));

    // invocation targeted <ws>/output/confsec/
    let expected_dir = workspace.path().join("output").join("confsec");
    {
        let world = h.runner.world.lock().unwrap();
        assert_eq!(world.report_calls.len(), 1);
        assert!(world.report_calls[0]
            .contains(&format!("--pdf-output={}", expected_dir.to_string_lossy())));
    }
    assert!(expected_dir.is_dir());

    // the failure is a user-visible notification carrying the stderr text
    let notes = h.state.notifications.recent(10).await;
    assert!(notes
        .iter()
        .any(|n| n.message.contains("crossplane parse error")));

    // failure isolation: the session did not change state
    assert_eq!(h.state.manager.status().await.state, "running");
}

// ── ordering & isolation properties ──────────────────────────

/// Rapid triggers are processed in arrival order with the prior session
/// fully stopped before the next start; never two concurrent sessions.
#[tokio::test]
async fn rapid_triggers_keep_at_most_one_session() {
    let h = harness(|_| {});
    h.runner.materialize_env();
    h.runner.seed_installed(&REQUIRED_PACKAGES);

    let events = h.state.events.clone();
    let state = h.state.clone();
    let world = h.runner.world.clone();
    let router_task = tokio::spawn(h.router.run());

    for _ in 0..3 {
        events.send(ChangeEvent::RestartRequested).await.unwrap();
    }
    events.send(ChangeEvent::InterpreterChanged).await.unwrap();
    events.send(ChangeEvent::ShutdownRequested).await.unwrap();
    router_task.await.unwrap();

    let world = world.lock().unwrap();
    // activation start + 4 restart cycles + shutdown stop
    assert_eq!(
        world.lifecycle,
        vec![
            "start", "stop", "start", "stop", "start", "stop", "start", "stop", "start", "stop",
        ]
    );
    assert_eq!(world.peak_sessions, 1);
    assert_eq!(world.active_sessions, 0);
    drop(world);

    assert_eq!(state.manager.status().await.state, "stopped");
}

/// A session start failure is reported, leaves the state stopped, and does
/// not unmake the already-Ready environment; the next trigger recovers.
#[tokio::test]
async fn start_failure_preserves_ready_environment() {
    let h = harness(|_| {});
    h.runner.materialize_env();
    h.runner.seed_installed(&REQUIRED_PACKAGES);
    h.runner.world.lock().unwrap().fail_spawn = true;

    h.router.activate().await;

    assert_eq!(h.state.manager.status().await.state, "stopped");
    assert_eq!(h.state.provisioner.status().await.unwrap(), EnvStatus::Ready);
    let notes = h.state.notifications.recent(10).await;
    assert!(notes
        .iter()
        .any(|n| n.message.contains("Language server failed to start")));

    // recovery on the next trigger
    h.runner.world.lock().unwrap().fail_spawn = false;
    h.router.handle(ChangeEvent::RestartRequested).await;
    assert_eq!(h.state.manager.status().await.state, "running");
}

/// A failed dependency install never proceeds to a session start (fail
/// closed); the partial environment is kept and the next trigger converges.
#[tokio::test]
async fn install_failure_fails_closed_and_recovers() {
    let h = harness(|_| {});
    h.runner.world.lock().unwrap().fail_install = true;

    h.router.activate().await;

    {
        let world = h.runner.world.lock().unwrap();
        assert!(world.lifecycle.is_empty(), "no session start after failed install");
    }
    assert_eq!(h.state.manager.status().await.state, "stopped");
    let notes = h.state.notifications.recent(10).await;
    assert!(notes
        .iter()
        .any(|n| n.message.contains("No matching distribution")));

    h.runner.world.lock().unwrap().fail_install = false;
    h.router.handle(ChangeEvent::RestartRequested).await;
    assert_eq!(h.state.provisioner.status().await.unwrap(), EnvStatus::Ready);
    assert_eq!(h.state.manager.status().await.state, "running");
}

/// With nothing resolvable, activation surfaces the actionable message,
/// provisions nothing, and stays stopped.
#[tokio::test]
async fn interpreter_not_found_leaves_stopped() {
    let h = harness(|cfg| {
        cfg.server.interpreter = None;
    });

    h.router.activate().await;

    assert_eq!(h.state.manager.status().await.state, "stopped");
    {
        let world = h.runner.world.lock().unwrap();
        assert_eq!(world.venv_calls, 0);
        assert!(world.lifecycle.is_empty());
    }
    let notes = h.state.notifications.recent(10).await;
    assert!(notes
        .iter()
        .any(|n| n.message.contains("No usable Python interpreter")));
}

/// Configuration changes are filtered: only keys under the server namespace
/// with launch impact trigger a restart.
#[tokio::test]
async fn configuration_changes_are_filtered() {
    let config_dir = tempfile::tempdir().unwrap();
    let config_path = config_dir.path().join("global.toml");
    std::fs::write(
        &config_path,
        "[server]\ninterpreter = \"/usr/bin/python3\"\n",
    )
    .unwrap();
    std::env::set_var("CONFSEC_CONFIG", &config_path);

    let h = harness(|_| {});
    h.runner.materialize_env();
    h.runner.seed_installed(&REQUIRED_PACKAGES);

    h.router.activate().await;
    assert_eq!(lifecycle(&h), vec!["start"]);

    // unrelated key → ignored
    h.router
        .handle(ChangeEvent::ConfigurationChanged("editor.fontSize".into()))
        .await;
    assert_eq!(lifecycle(&h), vec!["start"]);

    // server-namespaced key without launch impact → ignored
    h.router
        .handle(ChangeEvent::ConfigurationChanged("confsec.colorTheme".into()))
        .await;
    assert_eq!(lifecycle(&h), vec!["start"]);

    // relevant key → restart
    h.router
        .handle(ChangeEvent::ConfigurationChanged("confsec.args".into()))
        .await;
    assert_eq!(lifecycle(&h), vec!["start", "stop", "start"]);

    std::env::remove_var("CONFSEC_CONFIG");
}

// ── IPC surface ──────────────────────────────────────────────

#[tokio::test]
async fn ipc_status_and_restart_roundtrip() {
    let h = harness(|_| {});
    h.runner.materialize_env();
    h.runner.seed_installed(&REQUIRED_PACKAGES);

    let events = h.state.events.clone();
    let state = h.state.clone();
    let world = h.runner.world.clone();
    let router_task = tokio::spawn(h.router.run());

    // wait for activation to finish (the router handles events in order, so
    // a no-op probe event flushing through means activation completed)
    events.send(ChangeEvent::RestartRequested).await.unwrap();

    let app = confsec_host::ipc::build_router(state.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/server/restart")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/shutdown")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    router_task.await.unwrap();

    // activation + two queued restarts, then shutdown stop
    assert_eq!(world.lock().unwrap().lifecycle.len(), 6);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["session"]["state"], "stopped");
    assert_eq!(
        payload["interpreter"]["path"],
        serde_json::json!("/usr/bin/python3")
    );

    // further commands against a shut-down router are rejected
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/server/restart")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn ipc_notifications_polling() {
    let h = harness(|cfg| {
        cfg.server.interpreter = None;
    });
    h.router.activate().await; // produces the not-found notification

    let app = confsec_host::ipc::build_router(h.state.clone());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/notifications")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let notifications = payload["notifications"].as_array().unwrap();
    assert!(!notifications.is_empty());
    let last_id = notifications.last().unwrap()["id"].as_u64().unwrap();

    // nothing newer than the last id
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/notifications?since={}", last_id).as_str())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert!(payload["notifications"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn ipc_env_status_reports_missing() {
    let h = harness(|_| {});
    let app = confsec_host::ipc::build_router(h.state.clone());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/env/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(payload["status"], "missing");
}
