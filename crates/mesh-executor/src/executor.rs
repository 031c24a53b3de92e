//! Command dispatch and the container registry.
//!
//! The executor owns the id→container registry, the per-id operation locks,
//! and the outbound half of the control channel. Commands are read in
//! transport order; lifecycle operations for the same container are
//! serialised through its operation lock, while operations for distinct
//! containers proceed concurrently. Every command failure resolves to a
//! reply object; nothing crosses the dispatch boundary as a panic.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::channel::{ControlChannel, Inbound};
use crate::config::ExecutorConfig;
use crate::container::{Container, ContainerArgs, ContainerExit, StopOptions};
use crate::download::ArtifactFetcher;
use crate::error::{ExecutorError, ExecutorResult};
use crate::ports;
use crate::process::ProcessRuntime;
use mesh_proto::types::Env;
use mesh_proto::{Command, ContainerId, ControlUrl, DeployRequest, Notification, Reply};

/// The host-resident agent: registry, dispatcher, and notification source.
pub struct Executor {
    config: ExecutorConfig,
    control: ControlUrl,
    channel: Arc<dyn ControlChannel>,
    runtime: Arc<dyn ProcessRuntime>,
    fetcher: Arc<dyn ArtifactFetcher>,
    containers: Mutex<HashMap<ContainerId, Arc<Container>>>,
    op_locks: Mutex<HashMap<ContainerId, Arc<Mutex<()>>>>,
    events_tx: mpsc::UnboundedSender<ContainerExit>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ContainerExit>>>,
}

impl Executor {
    /// Builds an executor over the given collaborators.
    pub fn new(
        config: ExecutorConfig,
        control: ControlUrl,
        channel: Arc<dyn ControlChannel>,
        runtime: Arc<dyn ProcessRuntime>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            control,
            channel,
            runtime,
            fetcher,
            containers: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Runs the dispatch loop until the channel closes or `shutdown` is
    /// commanded, then closes the channel.
    pub async fn run(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) -> ExecutorResult<()> {
        self.announce().await?;

        let forwarder = {
            let rx = self.events_rx.lock().await.take();
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let Some(mut rx) = rx else { return };
                while let Some(exit) = rx.recv().await {
                    let note = Notification::ContainerExit {
                        id: exit.id,
                        reason: exit.reason,
                        pid: exit.pid,
                    };
                    if let Err(e) = this.channel.notify(&note).await {
                        warn!(error = %e, "failed to notify container exit");
                    }
                }
            })
        };

        while let Some(Inbound { request, reply }) = inbound.recv().await {
            let cmd = match Command::parse(&request) {
                Ok(cmd) => cmd,
                Err(e) => {
                    debug!(error = %e, "rejecting request");
                    let _ = reply.send(Reply::error(e.to_string()).into_value());
                    continue;
                }
            };

            if matches!(cmd, Command::Shutdown) {
                info!("shutdown commanded");
                let _ = reply.send(Reply::message("shutting down").into_value());
                break;
            }

            // The operation lock is taken in arrival order and travels into
            // the handler task, so same-id commands apply in order while
            // other ids keep flowing.
            let guard = match cmd.container_id() {
                Some(id) => Some(self.op_lock(id).await.lock_owned().await),
                None => None,
            };
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = this.handle(cmd).await;
                let _ = reply.send(outcome.into_value());
                drop(guard);
            });
        }

        forwarder.abort();
        self.channel.close().await
    }

    /// Sends the one-time `starting` notification.
    async fn announce(&self) -> ExecutorResult<()> {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);

        info!(hostname = %hostname, cpus = cpus, driver = %self.config.driver, "announcing");
        self.channel
            .notify(&Notification::Starting {
                hostname,
                cpus,
                driver: self.config.driver.clone(),
                address: self.config.advertised_address.clone(),
            })
            .await
    }

    /// Applies one command and produces its reply.
    pub async fn handle(self: &Arc<Self>, cmd: Command) -> Reply {
        match cmd {
            Command::Shutdown => Reply::message("shutting down"),
            Command::ContainerDeploy(req) => self.deploy(req).await,
            Command::ContainerSetOptions { id, options } => match self.lookup(&id).await {
                Ok(container) => {
                    container.set_start_options(options).await;
                    Reply::ok()
                }
                Err(e) => Reply::error(e.to_string()),
            },
            Command::ContainerSetEnv { id, env } => match self.lookup(&id).await {
                Ok(container) => {
                    let env = self.with_default_port(&id, env).await;
                    container.set_env(env).await;
                    Reply::ok()
                }
                Err(e) => Reply::error(e.to_string()),
            },
            Command::ContainerStart { id } => match self.lookup(&id).await {
                Ok(container) => match container.start().await {
                    Ok(()) => Reply::ok(),
                    Err(e) => Reply::error(e.to_string()),
                },
                Err(e) => Reply::error(e.to_string()),
            },
            Command::ContainerStop { id } => self.stop(&id, StopOptions::hard()).await,
            Command::ContainerSoftStop { id, timeout } => {
                self.stop(&id, StopOptions::soft(timeout.map(Duration::from_millis)))
                    .await
            }
            Command::ContainerRestart { id } => self.restart(&id, StopOptions::hard()).await,
            Command::ContainerSoftRestart { id, timeout } => {
                self.restart(&id, StopOptions::soft(timeout.map(Duration::from_millis)))
                    .await
            }
            Command::ContainerDestroy { id } => self.destroy(&id).await,
        }
    }

    /// Idempotent ensure: replace whatever ran under this id, install the
    /// new container, and start it in the background. The reply acknowledges
    /// installation, not readiness.
    async fn deploy(self: &Arc<Self>, req: DeployRequest) -> Reply {
        info!(id = %req.id, deployment = %req.deployment_id, "deploying");

        let previous = self.containers.lock().await.get(&req.id).cloned();
        if let Some(old) = previous {
            if let Err(e) = old.destroy().await {
                warn!(id = %req.id, error = %e, "failed to stop replaced container");
            }
        }

        let env = self.with_default_port(&req.id, req.env).await;
        let container = match Container::new(ContainerArgs {
            id: req.id.clone(),
            deployment_id: req.deployment_id,
            env,
            options: req.options,
            token: req.token,
            control: self.control.clone(),
            containers_dir: self.config.containers_dir(),
            supervisor: self.config.supervisor.clone(),
            grace: self.config.soft_stop_grace(),
            runtime: self.runtime.clone(),
            fetcher: self.fetcher.clone(),
            events: self.events_tx.clone(),
        }) {
            Ok(container) => Arc::new(container),
            Err(e) => return Reply::error(e.to_string()),
        };

        self.containers
            .lock()
            .await
            .insert(req.id.clone(), container.clone());

        tokio::spawn(async move {
            if let Err(e) = container.start().await {
                error!(id = %container.id(), error = %e, "deployed container failed to start");
            }
        });

        Reply::deploy(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    async fn stop(&self, id: &ContainerId, options: StopOptions) -> Reply {
        match self.lookup(id).await {
            Ok(container) => match container.stop(options).await {
                Ok(_) => Reply::ok(),
                Err(e) => Reply::message(e.to_string()),
            },
            Err(e) => Reply::error(e.to_string()),
        }
    }

    async fn restart(&self, id: &ContainerId, options: StopOptions) -> Reply {
        match self.lookup(id).await {
            Ok(container) => match container.restart(options).await {
                Ok(()) => Reply::ok(),
                Err(e) => Reply::message(e.to_string()),
            },
            Err(e) => Reply::error(e.to_string()),
        }
    }

    async fn destroy(&self, id: &ContainerId) -> Reply {
        let Ok(container) = self.lookup(id).await else {
            return Reply::error(ExecutorError::ContainerNotFound(id.clone()).to_string());
        };

        let result = container.destroy().await;
        self.containers.lock().await.remove(id);

        match result {
            Ok(_) => Reply::ok(),
            Err(e) => Reply::message(e.to_string()),
        }
    }

    async fn lookup(&self, id: &ContainerId) -> ExecutorResult<Arc<Container>> {
        self.containers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ExecutorError::ContainerNotFound(id.clone()))
    }

    async fn op_lock(&self, id: &ContainerId) -> Arc<Mutex<()>> {
        let mut locks = self.op_locks.lock().await;
        locks.entry(id.clone()).or_default().clone()
    }

    /// Defaults `PORT` to the lowest free port when the incoming env lacks
    /// one; an explicit `PORT` always wins. The target container's own
    /// current port does not count as taken.
    async fn with_default_port(&self, id: &ContainerId, mut env: Env) -> Env {
        if !env.contains_key("PORT") {
            let port = ports::unused_port(&self.assigned_ports(id).await, self.config.base_port);
            debug!(id = %id, port = port, "defaulted PORT");
            env.insert("PORT".to_owned(), port.to_string());
        }
        env
    }

    async fn assigned_ports(&self, exclude: &ContainerId) -> HashSet<u16> {
        let containers: Vec<(ContainerId, Arc<Container>)> = {
            let map = self.containers.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut ports = HashSet::new();
        for (id, container) in containers {
            if &id == exclude {
                continue;
            }
            if let Some(port) = container.port().await {
                ports.insert(port);
            }
        }
        ports
    }

    /// Registered container for `id`, if any.
    pub async fn container(&self, id: &ContainerId) -> Option<Arc<Container>> {
        self.containers.lock().await.get(id).cloned()
    }

    /// Number of registered containers.
    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::download::MockFetcher;
    use crate::process::MockRuntime;
    use mesh_proto::StartOptions;

    fn test_executor(runtime: Arc<MockRuntime>) -> (Arc<Executor>, Arc<MockChannel>) {
        let channel = Arc::new(MockChannel::new());
        let control = ControlUrl::parse("ws://exec-token@sched:8701/executor-control").unwrap();
        let executor = Executor::new(
            ExecutorConfig::default(),
            control,
            channel.clone(),
            runtime,
            Arc::new(MockFetcher::new()),
        );
        (executor, channel)
    }

    fn deploy_req(id: &str, deployment: &str) -> DeployRequest {
        DeployRequest {
            id: ContainerId::new(id),
            deployment_id: deployment.to_owned(),
            env: Env::new(),
            options: StartOptions::default(),
            token: "container-token".to_owned(),
        }
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

    #[tokio::test]
    async fn deploy_defaults_port_and_starts_in_background() {
        let runtime = Arc::new(MockRuntime::new());
        let (executor, _channel) = test_executor(runtime.clone());

        let reply = executor
            .handle(Command::ContainerDeploy(deploy_req("1", "dep-1")))
            .await;
        assert!(matches!(reply, Reply::Deploy { .. }));

        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 1).await;

        let container = executor.container(&ContainerId::new("1")).await.unwrap();
        assert_eq!(container.port().await, Some(3001));
    }

    #[tokio::test]
    async fn deploy_allocates_lowest_free_port_per_container() {
        let runtime = Arc::new(MockRuntime::new());
        let (executor, _channel) = test_executor(runtime.clone());

        for (id, dep) in [("1", "a"), ("2", "b"), ("3", "c")] {
            executor
                .handle(Command::ContainerDeploy(deploy_req(id, dep)))
                .await;
        }
        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 3).await;

        let mut ports = HashSet::new();
        for id in ["1", "2", "3"] {
            let container = executor.container(&ContainerId::new(id)).await.unwrap();
            ports.insert(container.port().await.unwrap());
        }
        assert_eq!(ports, HashSet::from([3001, 3002, 3003]));
    }

    #[tokio::test]
    async fn deploy_over_existing_id_stops_old_process_first() {
        let runtime = Arc::new(MockRuntime::new());
        let (executor, _channel) = test_executor(runtime.clone());

        executor
            .handle(Command::ContainerDeploy(deploy_req("1", "old")))
            .await;
        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 1).await;

        executor
            .handle(Command::ContainerDeploy(deploy_req("1", "new")))
            .await;
        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 2).await;

        assert!(!runtime.proc(0).unwrap().is_alive());
        assert!(runtime.proc(1).unwrap().is_alive());
        assert_eq!(executor.container_count().await, 1);
        assert_eq!(
            executor
                .container(&ContainerId::new("1"))
                .await
                .unwrap()
                .deployment_id(),
            "new"
        );
    }

    #[tokio::test]
    async fn per_id_command_on_unknown_id_replies_error_without_state_change() {
        let runtime = Arc::new(MockRuntime::new());
        let (executor, _channel) = test_executor(runtime.clone());

        for cmd in [
            Command::ContainerStart {
                id: ContainerId::new("9"),
            },
            Command::ContainerStop {
                id: ContainerId::new("9"),
            },
            Command::ContainerDestroy {
                id: ContainerId::new("9"),
            },
        ] {
            let reply = executor.handle(cmd).await;
            assert_eq!(reply, Reply::error("container 9 does not exist"));
        }

        assert_eq!(executor.container_count().await, 0);
        assert_eq!(runtime.spawn_count(), 0);
    }

    #[tokio::test]
    async fn set_env_defaults_port_excluding_the_target_itself() {
        let runtime = Arc::new(MockRuntime::new());
        let (executor, _channel) = test_executor(runtime.clone());

        executor
            .handle(Command::ContainerDeploy(deploy_req("1", "a")))
            .await;
        executor
            .handle(Command::ContainerDeploy(deploy_req("2", "b")))
            .await;
        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 2).await;

        // Container 1 held 3001; only container 2's 3002 counts as taken,
        // so the default lands back on 3001.
        let reply = executor
            .handle(Command::ContainerSetEnv {
                id: ContainerId::new("1"),
                env: Env::new(),
            })
            .await;
        assert_eq!(reply, Reply::ok());
        let container = executor.container(&ContainerId::new("1")).await.unwrap();
        assert_eq!(container.port().await, Some(3001));

        // No restart happened.
        assert_eq!(runtime.spawn_count(), 2);

        // Explicit PORT wins over the allocator.
        executor
            .handle(Command::ContainerSetEnv {
                id: ContainerId::new("1"),
                env: Env::from([("PORT".to_owned(), "9999".to_owned())]),
            })
            .await;
        assert_eq!(container.port().await, Some(9999));
    }

    #[tokio::test]
    async fn destroy_stops_and_removes() {
        let runtime = Arc::new(MockRuntime::new());
        let (executor, _channel) = test_executor(runtime.clone());

        executor
            .handle(Command::ContainerDeploy(deploy_req("1", "a")))
            .await;
        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 1).await;

        let reply = executor
            .handle(Command::ContainerDestroy {
                id: ContainerId::new("1"),
            })
            .await;
        assert_eq!(reply, Reply::ok());
        assert_eq!(executor.container_count().await, 0);
        assert!(!runtime.proc(0).unwrap().is_alive());
    }

    #[tokio::test]
    async fn soft_stop_flag_routes_to_graceful_stop() {
        let runtime = Arc::new(MockRuntime::new());
        let (executor, _channel) = test_executor(runtime.clone());

        executor
            .handle(Command::ContainerDeploy(deploy_req("1", "a")))
            .await;
        let rt = runtime.clone();
        wait_for(move || rt.spawn_count() == 1).await;

        let reply = executor
            .handle(Command::ContainerSoftStop {
                id: ContainerId::new("1"),
                timeout: Some(20),
            })
            .await;
        assert_eq!(reply, Reply::ok());
        assert!(!runtime.proc(0).unwrap().is_alive());
        assert_eq!(runtime.spawn_count(), 1);
    }
}
