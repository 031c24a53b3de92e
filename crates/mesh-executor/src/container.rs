//! One deployment's process lifecycle.
//!
//! A container fetches its artifact, runs it under supervision, and answers
//! stop/restart/destroy requests while recovering from crashes. State is an
//! explicit enum; the exit watcher derives respawn policy from it, so an
//! exit that arrives during an intentional stop is reported to the stopper
//! instead of triggering a respawn.
//!
//! ```text
//! Created ──▶ Downloading ──▶ Running ──▶ StoppingSoft ─┐
//!                               │   ▲                   ├──▶ Stopped
//!                               │   │      StoppingHard ┘       │
//!                               ▼   │                           ▼
//!                            (crash └── respawn)            Destroyed
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::download::ArtifactFetcher;
use crate::error::{mandatory, ExecutorError, ExecutorResult};
use crate::process::{ProcessRuntime, ProcessSignaller, SpawnSpec, SpawnedProcess};
use mesh_proto::{ContainerId, ControlUrl, ExitReason, StartOptions};
use mesh_proto::types::Env;

/// Environment variables forwarded from the executor's own environment.
/// The container's configured env wins on conflict.
const INHERITED_ENV: &[&str] = &["MESH_LICENSE", "RUST_LOG", "PATH"];

/// Lifecycle states of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Constructed, nothing started yet.
    Created,
    /// Artifact download in progress.
    Downloading,
    /// Supervised process running and expected to keep running.
    Running,
    /// Graceful stop requested; waiting out the grace period.
    StoppingSoft,
    /// Terminate signal sent; waiting for the exit.
    StoppingHard,
    /// No live process; may be started again.
    Stopped,
    /// Removed; must never spawn again.
    Destroyed,
}

/// How to stop a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Graceful stop with escalation after the grace period.
    pub soft: bool,

    /// Grace period override; the configured default applies when `None`.
    pub timeout: Option<Duration>,
}

impl StopOptions {
    /// Immediate terminate signal.
    #[must_use]
    pub const fn hard() -> Self {
        Self {
            soft: false,
            timeout: None,
        }
    }

    /// Graceful stop with an optional grace override.
    #[must_use]
    pub const fn soft(timeout: Option<Duration>) -> Self {
        Self {
            soft: true,
            timeout,
        }
    }
}

/// Emitted on every supervised process termination, expected or not.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerExit {
    /// Container whose process exited.
    pub id: ContainerId,
    /// Observed reason.
    pub reason: ExitReason,
    /// Pid of the exited process.
    pub pid: u32,
}

/// Everything needed to construct a [`Container`].
pub struct ContainerArgs {
    /// Scheduler-assigned id.
    pub id: ContainerId,
    /// Artifact version to run.
    pub deployment_id: String,
    /// Environment for the next run.
    pub env: Env,
    /// Start options for the next run.
    pub options: StartOptions,
    /// This container's own control token.
    pub token: String,
    /// Executor control URL the download/control URLs derive from.
    pub control: ControlUrl,
    /// Directory holding all container directories.
    pub containers_dir: PathBuf,
    /// Supervisor binary.
    pub supervisor: PathBuf,
    /// Default soft-stop grace period.
    pub grace: Duration,
    /// Process runtime.
    pub runtime: Arc<dyn ProcessRuntime>,
    /// Artifact fetcher.
    pub fetcher: Arc<dyn ArtifactFetcher>,
    /// Exit event sink (forwarded as `container-exit` notifications).
    pub events: mpsc::UnboundedSender<ContainerExit>,
}

/// A supervised child process representing one deployed instance.
pub struct Container {
    id: ContainerId,
    deployment_id: String,
    download_url: Url,
    container_url: Url,
    exec_token: String,
    dir: PathBuf,
    supervisor: PathBuf,
    grace: Duration,
    runtime: Arc<dyn ProcessRuntime>,
    fetcher: Arc<dyn ArtifactFetcher>,
    events: mpsc::UnboundedSender<ContainerExit>,
    inner: Mutex<Inner>,
}

struct Inner {
    env: Env,
    options: StartOptions,
    state: ContainerState,
    live: Option<Live>,
}

struct Live {
    pid: u32,
    signaller: Box<dyn ProcessSignaller>,
    stop_tx: Option<oneshot::Sender<ExitReason>>,
}

impl Container {
    /// Constructs a container, validating mandatory fields synchronously.
    pub fn new(args: ContainerArgs) -> ExecutorResult<Self> {
        mandatory("id", args.id.as_str())?;
        mandatory("deploymentId", &args.deployment_id)?;
        mandatory("token", &args.token)?;

        let download_url = args.control.download_url(&args.id, &args.deployment_id);
        let container_url = args.control.container_url(&args.token);
        let dir = args.containers_dir.join(args.id.as_str());

        debug!(
            id = %args.id,
            deployment = %args.deployment_id,
            download = %download_url,
            dir = %dir.display(),
            "container created"
        );

        Ok(Self {
            id: args.id,
            deployment_id: args.deployment_id,
            download_url,
            container_url,
            exec_token: args.control.token().to_owned(),
            dir,
            supervisor: args.supervisor,
            grace: args.grace,
            runtime: args.runtime,
            fetcher: args.fetcher,
            events: args.events,
            inner: Mutex::new(Inner {
                env: args.env,
                options: args.options,
                state: ContainerState::Created,
                live: None,
            }),
        })
    }

    /// Container id.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Deployment (artifact version) this container runs.
    #[must_use]
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Artifact download URL (token travels in the header, not here).
    #[must_use]
    pub fn download_url(&self) -> &Url {
        &self.download_url
    }

    /// The control URL handed to the supervised process.
    #[must_use]
    pub fn container_url(&self) -> &Url {
        &self.container_url
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ContainerState {
        self.inner.lock().await.state
    }

    /// The `PORT` this container's env assigns, if any and numeric.
    pub async fn port(&self) -> Option<u16> {
        let inner = self.inner.lock().await;
        inner.env.get("PORT").and_then(|p| p.parse().ok())
    }

    /// Snapshot of the configured environment.
    pub async fn env(&self) -> Env {
        self.inner.lock().await.env.clone()
    }

    /// Replaces the environment consumed by the next run. Does not restart.
    pub async fn set_env(&self, env: Env) {
        debug!(id = %self.id, "set env");
        self.inner.lock().await.env = env;
    }

    /// Replaces the start options consumed by the next run.
    pub async fn set_start_options(&self, options: StartOptions) {
        debug!(id = %self.id, ?options, "set start options");
        self.inner.lock().await.options = options;
    }

    /// Downloads the artifact then spawns the process. Either stage's
    /// failure aborts the sequence and is returned.
    pub async fn start(self: &Arc<Self>) -> ExecutorResult<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == ContainerState::Destroyed {
                return Err(ExecutorError::Destroyed(self.id.clone()));
            }
            inner.state = ContainerState::Downloading;
        }

        if let Err(e) = self
            .fetcher
            .fetch(&self.download_url, &self.exec_token, &self.dir)
            .await
        {
            error!(id = %self.id, error = %e, "artifact download failed");
            let mut inner = self.inner.lock().await;
            if inner.state == ContainerState::Downloading {
                inner.state = ContainerState::Stopped;
            }
            return Err(e);
        }

        // A download finishing after this container was destroyed or
        // replaced must not spawn a stale process; run() re-checks.
        self.run().await
    }

    /// Spawns the supervised process from the stored configuration.
    ///
    /// Returns a boxed future: `run` and `watch_exit` call each other, and
    /// boxing breaks the async recursion so the future can be proven `Send`.
    pub(crate) fn run<'a>(
        self: &'a Arc<Self>,
    ) -> futures::future::BoxFuture<'a, ExecutorResult<()>> {
        Box::pin(async move {
            let spec = {
                let mut inner = self.inner.lock().await;
                if inner.state == ContainerState::Destroyed {
                    return Err(ExecutorError::Destroyed(self.id.clone()));
                }
                if inner.live.is_some() {
                    // At most one live process per container.
                    return Ok(());
                }
                self.spawn_spec(&inner)
            };

            let SpawnedProcess {
                pid,
                signaller,
                exit,
            } = self.runtime.spawn(&spec).await?;

            {
                let mut inner = self.inner.lock().await;
                if inner.state == ContainerState::Destroyed {
                    // Destroyed while spawning; reap the fresh process.
                    let _ = signaller.signal(Signal::SIGTERM);
                    return Err(ExecutorError::Destroyed(self.id.clone()));
                }
                inner.live = Some(Live {
                    pid,
                    signaller,
                    stop_tx: None,
                });
                inner.state = ContainerState::Running;
            }

            info!(id = %self.id, pid = pid, "container running");

            let this = Arc::clone(self);
            tokio::spawn(async move { this.watch_exit(exit, pid).await });
            Ok(())
        })
    }

    fn spawn_spec(&self, inner: &Inner) -> SpawnSpec {
        let mut args = vec![
            format!("--cluster={}", inner.options.size),
            format!("--control={}", self.container_url),
        ];
        if inner.options.trace {
            args.push("--trace".to_owned());
        }
        args.push(self.dir.display().to_string());

        let mut env = Env::new();
        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                env.insert((*key).to_owned(), value);
            }
        }
        env.extend(inner.env.clone());

        SpawnSpec {
            program: self.supervisor.clone(),
            args,
            env,
        }
    }

    /// Observes one process generation's exit: reports the reason to a
    /// pending stop, emits the exit event, and respawns after a crash.
    async fn watch_exit(self: Arc<Self>, exit: oneshot::Receiver<ExitReason>, pid: u32) {
        let reason = exit.await.unwrap_or(ExitReason::Code(-1));

        let respawn = {
            let mut inner = self.inner.lock().await;
            let stop_tx = inner.live.take().and_then(|live| live.stop_tx);
            let respawn = inner.state == ContainerState::Running;
            if inner.state != ContainerState::Destroyed {
                inner.state = ContainerState::Stopped;
            }
            if let Some(tx) = stop_tx {
                let _ = tx.send(reason.clone());
            }
            respawn
        };

        debug!(id = %self.id, pid = pid, reason = %reason, expected = !respawn, "process exit");
        let _ = self.events.send(ContainerExit {
            id: self.id.clone(),
            reason: reason.clone(),
            pid,
        });

        if respawn {
            warn!(id = %self.id, pid = pid, reason = %reason, "unexpected exit, restarting");
            if let Err(e) = self.run().await {
                error!(id = %self.id, error = %e, "respawn failed");
            }
        }
    }

    /// Stops the process. Hard stops signal immediately; soft stops wait
    /// out the grace period before escalating. Stopping a container with no
    /// live process completes immediately with no reason.
    pub async fn stop(&self, options: StopOptions) -> ExecutorResult<Option<ExitReason>> {
        let rx = {
            let mut inner = self.inner.lock().await;
            let Some(live) = inner.live.as_mut() else {
                return Ok(None);
            };
            let (tx, rx) = oneshot::channel();
            live.stop_tx = Some(tx);
            inner.state = if options.soft {
                ContainerState::StoppingSoft
            } else {
                ContainerState::StoppingHard
            };
            rx
        };

        if options.soft {
            let grace = options.timeout.unwrap_or(self.grace);
            self.soft_stop(rx, grace).await
        } else {
            self.hard_stop(rx).await
        }
    }

    async fn hard_stop(
        &self,
        rx: oneshot::Receiver<ExitReason>,
    ) -> ExecutorResult<Option<ExitReason>> {
        if !self.signal_live(Signal::SIGTERM).await? {
            // Already gone; the exit observer owes us nothing further.
            debug!(id = %self.id, "process already gone");
            return Ok(None);
        }
        Ok(rx.await.ok())
    }

    /// Waits for a voluntary exit within `grace`, then escalates to a hard
    /// stop. The reason oneshot is the single-fire guard: once the caller
    /// has been satisfied by the natural exit it cannot be completed again,
    /// and only an escalation *error* reaches the caller instead.
    async fn soft_stop(
        &self,
        mut rx: oneshot::Receiver<ExitReason>,
        grace: Duration,
    ) -> ExecutorResult<Option<ExitReason>> {
        debug!(id = %self.id, grace_ms = grace.as_millis() as u64, "soft stop");

        match tokio::time::timeout(grace, &mut rx).await {
            Ok(result) => Ok(result.ok()),
            Err(_elapsed) => {
                warn!(id = %self.id, "soft stop timed out, hard stopping");
                {
                    let mut inner = self.inner.lock().await;
                    if inner.live.is_some() {
                        inner.state = ContainerState::StoppingHard;
                    }
                }
                self.signal_live(Signal::SIGTERM).await?;
                Ok(rx.await.ok())
            }
        }
    }

    async fn signal_live(&self, signal: Signal) -> ExecutorResult<bool> {
        let inner = self.inner.lock().await;
        match inner.live.as_ref() {
            Some(live) => live.signaller.signal(signal),
            None => Ok(false),
        }
    }

    /// Stop (honouring the soft flag) then a fresh start.
    pub async fn restart(self: &Arc<Self>, options: StopOptions) -> ExecutorResult<()> {
        self.stop(options).await?;
        self.start().await
    }

    /// Hard stop and mark destroyed; the owning executor removes the
    /// registry entry.
    pub async fn destroy(&self) -> ExecutorResult<Option<ExitReason>> {
        info!(id = %self.id, "destroying container");
        let result = self.stop(StopOptions::hard()).await;

        let mut inner = self.inner.lock().await;
        inner.state = ContainerState::Destroyed;
        if let Some(live) = inner.live.as_ref() {
            // A crash respawn slipped in between the stop and the mark.
            let _ = live.signaller.signal(Signal::SIGTERM);
        }
        result
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("deployment_id", &self.deployment_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{ArtifactFetcher, MockFetcher};
    use crate::process::MockRuntime;
    use async_trait::async_trait;
    use std::path::Path;

    fn make_container(
        runtime: Arc<MockRuntime>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> (Arc<Container>, mpsc::UnboundedReceiver<ContainerExit>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let container = Container::new(ContainerArgs {
            id: ContainerId::new("3"),
            deployment_id: "12345".to_owned(),
            env: Env::from([("PORT".to_owned(), "3003".to_owned())]),
            options: StartOptions::default(),
            token: "sched-token".to_owned(),
            control: ControlUrl::parse("ws://exec-token@some.host:8765/executor-control").unwrap(),
            containers_dir: PathBuf::from("containers"),
            supervisor: PathBuf::from("mesh-supervisor"),
            grace: Duration::from_secs(5),
            runtime,
            fetcher,
            events,
        })
        .unwrap();
        (Arc::new(container), events_rx)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn constructor_derives_urls_and_validates() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _rx) = make_container(runtime, Arc::new(MockFetcher::new()));

        assert_eq!(
            container.download_url().as_str(),
            "http://some.host:8765/artifacts/executor/3/12345"
        );
        assert_eq!(
            container.container_url().as_str(),
            "http://sched-token@some.host:8765/"
        );

        let (events, _) = mpsc::unbounded_channel();
        let err = Container::new(ContainerArgs {
            id: ContainerId::new("3"),
            deployment_id: "12345".to_owned(),
            env: Env::new(),
            options: StartOptions::default(),
            token: String::new(),
            control: ControlUrl::parse("ws://t@h:1").unwrap(),
            containers_dir: PathBuf::from("containers"),
            supervisor: PathBuf::from("mesh-supervisor"),
            grace: Duration::from_secs(5),
            runtime: Arc::new(MockRuntime::new()),
            fetcher: Arc::new(MockFetcher::new()),
            events,
        })
        .unwrap_err();
        assert!(matches!(err, ExecutorError::MissingField("token")));
    }

    #[tokio::test]
    async fn start_spawns_with_contract_argv() {
        let runtime = Arc::new(MockRuntime::new());
        let fetcher = Arc::new(MockFetcher::new());
        let (container, _rx) = make_container(runtime.clone(), fetcher.clone());

        container
            .set_start_options(StartOptions {
                size: mesh_proto::ClusterSize::Fixed(9),
                trace: false,
            })
            .await;
        container.start().await.unwrap();

        let spawns = runtime.spawns();
        assert_eq!(spawns.len(), 1);
        assert_eq!(spawns[0].args[0], "--cluster=9");
        assert_eq!(
            spawns[0].args[1],
            "--control=http://sched-token@some.host:8765/"
        );
        assert_eq!(*spawns[0].args.last().unwrap(), "containers/3".to_owned());
        assert_eq!(spawns[0].env["PORT"], "3003");

        // The download authenticated with the execution token via header.
        let fetches = fetcher.fetches();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].1, "exec-token");

        assert_eq!(container.state().await, ContainerState::Running);
    }

    #[tokio::test]
    async fn download_failure_aborts_start() {
        let runtime = Arc::new(MockRuntime::new());
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.fail_downloads();
        let (container, _rx) = make_container(runtime.clone(), fetcher);

        let err = container.start().await.unwrap_err();
        assert!(matches!(err, ExecutorError::DownloadStatus { status: 500 }));
        assert_eq!(runtime.spawn_count(), 0);
        assert_eq!(container.state().await, ContainerState::Stopped);
    }

    #[tokio::test]
    async fn hard_stop_reports_sigterm_and_suppresses_respawn() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, mut events) = make_container(runtime.clone(), Arc::new(MockFetcher::new()));

        container.start().await.unwrap();
        let reason = container.stop(StopOptions::hard()).await.unwrap();
        assert_eq!(reason, Some(ExitReason::signal("SIGTERM")));

        let exit = events.recv().await.unwrap();
        assert_eq!(exit.reason, ExitReason::signal("SIGTERM"));
        assert_eq!(exit.pid, 9876);

        // No respawn follows an explicit stop.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.spawn_count(), 1);
        assert_eq!(container.state().await, ContainerState::Stopped);
    }

    #[tokio::test]
    async fn stop_without_live_process_is_noop() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _rx) = make_container(runtime, Arc::new(MockFetcher::new()));
        assert_eq!(container.stop(StopOptions::hard()).await.unwrap(), None);
        assert_eq!(
            container.stop(StopOptions::soft(None)).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn restart_spawns_fresh_process() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _rx) = make_container(runtime.clone(), Arc::new(MockFetcher::new()));

        container.start().await.unwrap();
        container.restart(StopOptions::hard()).await.unwrap();

        let spawns = runtime.spawns();
        assert_eq!(spawns.len(), 2);
        assert_eq!(runtime.proc(1).unwrap().pid(), 9877);
        assert_eq!(container.state().await, ContainerState::Running);
    }

    #[tokio::test]
    async fn soft_stop_reports_natural_exit_reason() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _rx) = make_container(runtime.clone(), Arc::new(MockFetcher::new()));

        container.start().await.unwrap();
        let handle = runtime.last_proc().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.exit(ExitReason::Code(0));
        });

        let reason = container
            .stop(StopOptions::soft(Some(Duration::from_secs(1))))
            .await
            .unwrap();
        assert_eq!(reason, Some(ExitReason::Code(0)));
        assert_eq!(runtime.spawn_count(), 1);
    }

    #[tokio::test]
    async fn soft_stop_escalates_after_grace_period() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _rx) = make_container(runtime.clone(), Arc::new(MockFetcher::new()));

        container.start().await.unwrap();
        let reason = container
            .stop(StopOptions::soft(Some(Duration::from_millis(50))))
            .await
            .unwrap();
        assert_eq!(reason, Some(ExitReason::signal("SIGTERM")));
        assert_eq!(runtime.spawn_count(), 1);
    }

    #[tokio::test]
    async fn unexpected_exit_respawns_once_with_identical_arguments() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, mut events) = make_container(runtime.clone(), Arc::new(MockFetcher::new()));

        container.start().await.unwrap();
        runtime.last_proc().unwrap().exit(ExitReason::Code(1));

        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 2).await;

        let spawns = runtime.spawns();
        assert_eq!(spawns[0], spawns[1]);
        assert_eq!(events.recv().await.unwrap().reason, ExitReason::Code(1));
        assert_eq!(container.state().await, ContainerState::Running);

        // A subsequent explicit stop does not respawn.
        container.stop(StopOptions::hard()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.spawn_count(), 2);
    }

    /// Fetcher that stalls until released, for exercising the stale
    /// download guard.
    struct GatedFetcher {
        release: Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl ArtifactFetcher for GatedFetcher {
        async fn fetch(&self, _url: &Url, _token: &str, _dest: &Path) -> ExecutorResult<()> {
            let rx = self.release.lock().await.take().expect("single fetch");
            let _ = rx.await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn download_completing_after_destroy_does_not_spawn() {
        let runtime = Arc::new(MockRuntime::new());
        let (release_tx, release_rx) = oneshot::channel();
        let fetcher = Arc::new(GatedFetcher {
            release: Mutex::new(Some(release_rx)),
        });
        let (container, _rx) = make_container(runtime.clone(), fetcher);

        let starter = container.clone();
        let start = tokio::spawn(async move { starter.start().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        container.destroy().await.unwrap();
        release_tx.send(()).unwrap();

        let result = start.await.unwrap();
        assert!(matches!(result, Err(ExecutorError::Destroyed(_))));
        assert_eq!(runtime.spawn_count(), 0);
        assert_eq!(container.state().await, ContainerState::Destroyed);
    }

    #[tokio::test]
    async fn set_env_does_not_restart() {
        let runtime = Arc::new(MockRuntime::new());
        let (container, _rx) = make_container(runtime.clone(), Arc::new(MockFetcher::new()));

        container.start().await.unwrap();
        container
            .set_env(Env::from([("PORT".to_owned(), "3005".to_owned())]))
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.spawn_count(), 1);
        assert_eq!(container.port().await, Some(3005));

        // The new env is consumed by the next run.
        container.restart(StopOptions::hard()).await.unwrap();
        assert_eq!(runtime.spawns()[1].env["PORT"], "3005");
    }
}
