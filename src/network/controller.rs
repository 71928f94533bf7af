/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::{
    control_client::{ControlClient, ControlStatus},
    probe,
    schedule::{run_schedule_with, ConditionSchedule},
    server_command, NetworkCondition, ServerMetrics, StreamConfig,
};
use crate::{
    config::{secs, ServerSettings},
    error::OrchestratorError,
    process_control::{self, ProcessHandle, ProcessSupervisor},
};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};
use tokio::{sync::OnceCell, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLLER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Port bookkeeping. Slots only ever move forward; ports held by live servers are skipped.
#[derive(Debug)]
struct PortBook {
    base: u16,
    control_offset: u16,
    next_slot: u16,
    in_use: HashSet<u16>,
}

impl PortBook {
    fn new(base: u16, control_offset: u16) -> Self {
        Self {
            base,
            control_offset,
            next_slot: 0,
            in_use: HashSet::new(),
        }
    }

    fn control_for(&self, data: u16) -> anyhow::Result<u16> {
        data.checked_add(self.control_offset)
            .ok_or_else(|| OrchestratorError::configuration(format!("no control port available for data port {data}")))
    }

    fn allocate(&mut self, data: Option<u16>, control: Option<u16>) -> anyhow::Result<(u16, u16)> {
        if let Some(port) = control.filter(|port| self.in_use.contains(port)) {
            return Err(OrchestratorError::configuration(format!(
                "control port {port} is already used by a running server"
            )));
        }

        let data = match data {
            Some(port) => {
                if self.in_use.contains(&port) {
                    return Err(OrchestratorError::configuration(format!(
                        "port {port} is already used by a running server"
                    )));
                }
                port
            }
            None => loop {
                let port = self
                    .base
                    .checked_add(self.next_slot)
                    .ok_or_else(|| OrchestratorError::configuration("server port range exhausted"))?;
                self.next_slot += 1;
                let paired = match control {
                    Some(control) => control,
                    None => self.control_for(port)?,
                };
                if !self.in_use.contains(&port) && !self.in_use.contains(&paired) {
                    break port;
                }
            },
        };

        let control = match control {
            Some(port) => port,
            None => self.control_for(data)?,
        };
        if control == data || self.in_use.contains(&control) {
            return Err(OrchestratorError::configuration(format!(
                "control port {control} is not available"
            )));
        }

        self.in_use.insert(data);
        self.in_use.insert(control);
        Ok((data, control))
    }

    fn release(&mut self, data: u16, control: u16) {
        self.in_use.remove(&data);
        self.in_use.remove(&control);
    }
}

struct ServerInstance {
    streams: Vec<StreamConfig>,
    data_port: u16,
    control_port: u16,
    process_name: String,
    handle: ProcessHandle,
    client: ControlClient,
    metrics: Arc<RwLock<ServerMetrics>>,
    poller_token: CancellationToken,
    poller: JoinHandle<()>,
}

struct Registry {
    instances: HashMap<String, ServerInstance>,
    ports: PortBook,
}

/// What callers get to see about a live server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub data_port: u16,
    pub control_port: u16,
    pub streams: Vec<StreamConfig>,
    pub urls: Vec<String>,
}

/// Owns the emulated media servers of one run. Processes go through the shared supervisor; this
/// type adds port allocation, readiness probing, metrics polling and the control channel.
pub struct NetworkImpairmentController {
    settings: ServerSettings,
    root: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
    registry: Mutex<Registry>,
    binary: OnceCell<String>,
}

impl NetworkImpairmentController {
    pub fn new(settings: ServerSettings, root: PathBuf, supervisor: Arc<ProcessSupervisor>) -> Self {
        let ports = PortBook::new(settings.base_port, settings.control_port_offset);
        Self {
            settings,
            root,
            supervisor,
            registry: Mutex::new(Registry {
                instances: HashMap::new(),
                ports,
            }),
            binary: OnceCell::new(),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn process_name(name: &str) -> String {
        format!("server/{name}")
    }

    fn server_cwd(&self) -> PathBuf {
        match &self.settings.cwd {
            Some(cwd) => self.root.join(cwd),
            None => self.root.clone(),
        }
    }

    /// Stream configs with sources made absolute. Fails before anything is launched when a
    /// source does not exist.
    fn resolve_streams(&self, streams: &[StreamConfig]) -> anyhow::Result<Vec<StreamConfig>> {
        if streams.is_empty() {
            return Err(OrchestratorError::configuration("a server needs at least one stream"));
        }

        streams
            .iter()
            .map(|stream| {
                let joined = self.root.join(&stream.source);
                let source = std::fs::canonicalize(&joined).map_err(|_| {
                    OrchestratorError::configuration(format!(
                        "source file not found: {}",
                        joined.display()
                    ))
                })?;
                if let Some(scenario) = &stream.network.scenario {
                    if !super::profiles::is_known_scenario(scenario) {
                        warn!("Unknown network scenario '{}' for {}", scenario, stream.mount);
                    }
                }
                Ok(StreamConfig {
                    source,
                    ..stream.clone()
                })
            })
            .collect()
    }

    /// Command line a server for `streams` would be started with, on the first ports the
    /// controller would hand out. Nothing is launched.
    pub fn preview_command(&self, streams: &[StreamConfig]) -> String {
        let data_port = self.settings.base_port;
        let control_port = data_port.saturating_add(self.settings.control_port_offset);
        server_command::server_spec(
            &Self::process_name("preview"),
            &self.settings,
            &self.settings.binary,
            None,
            streams,
            data_port,
            control_port,
        )
        .command_line()
    }

    /// Launches a server for `streams` and waits until it serves. Any same-named server is
    /// stopped first. Ports are allocated when not given.
    pub async fn start_server(
        &self,
        name: &str,
        streams: &[StreamConfig],
        data_port: Option<u16>,
        control_port: Option<u16>,
    ) -> anyhow::Result<ServerInfo> {
        let streams = self.resolve_streams(streams)?;

        if self.is_running(name) {
            warn!("Server {} already running, stopping it first", name);
            self.stop_server(name).await?;
        }

        let (data_port, control_port) = self.registry().ports.allocate(data_port, control_port)?;
        match self.launch(name, streams, data_port, control_port).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.registry().ports.release(data_port, control_port);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        name: &str,
        streams: Vec<StreamConfig>,
        data_port: u16,
        control_port: u16,
    ) -> anyhow::Result<ServerInfo> {
        let cwd = self.server_cwd();
        let program = self
            .binary
            .get_or_try_init(|| server_command::ensure_binary(&self.settings, &cwd))
            .await?
            .clone();

        let process_name = Self::process_name(name);
        let spec = server_command::server_spec(
            &process_name,
            &self.settings,
            &program,
            Some(cwd),
            &streams,
            data_port,
            control_port,
        );
        info!("Starting server {} on port {} (control {})", name, data_port, control_port);
        debug!("Command: {}", spec.command_line());
        let handle = self.supervisor.start(spec).await?;

        let client = ControlClient::new(&self.settings.host, control_port, &self.settings.control_prefix);
        if let Err(e) = self.wait_until_ready(&handle, &client, data_port).await {
            warn!("Server {} failed to start: {}", name, e);
            self.supervisor.stop(&process_name).await?;
            return Err(e);
        }

        let metrics = Arc::new(RwLock::new(ServerMetrics::default()));
        let poller_token = CancellationToken::new();
        let poller = spawn_metrics_poller(
            name.to_string(),
            client.clone(),
            metrics.clone(),
            secs(self.settings.metrics_interval).max(Duration::from_millis(100)),
            poller_token.clone(),
        );

        let instance = ServerInstance {
            streams,
            data_port,
            control_port,
            process_name,
            handle,
            client,
            metrics,
            poller_token,
            poller,
        };
        let info = self.info_of(name, &instance);
        let displaced = self.registry().instances.insert(name.to_string(), instance);
        if let Some(displaced) = displaced {
            // another start under the same name finished first; only the newest survives
            warn!("Server {} was started concurrently, stopping the older one", name);
            self.registry()
                .ports
                .release(displaced.data_port, displaced.control_port);
            self.shutdown(name, displaced).await?;
        }

        info!("Server {} started successfully", name);
        Ok(info)
    }

    /// Data port first, then the control status route. A control surface that refuses
    /// connections once the data port is open is taken as absent.
    async fn wait_until_ready(
        &self,
        handle: &ProcessHandle,
        client: &ControlClient,
        data_port: u16,
    ) -> anyhow::Result<()> {
        let timeout = secs(self.settings.ready_timeout);
        let deadline = Instant::now() + timeout;

        loop {
            process_control::ensure_running(handle)?;

            if probe::port_open(&self.settings.host, data_port).await {
                debug!("Data port {} is open", data_port);
                match client.status().await {
                    ControlStatus::Ready => return Ok(()),
                    ControlStatus::Unreachable => {
                        debug!("No control endpoint at {}, treating server as ready", client.base_url());
                        return Ok(());
                    }
                    ControlStatus::NotReady(code) => debug!("Control status returned {}", code),
                }
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::readiness_timeout(
                    format!("server {}", handle.name),
                    timeout,
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Pushes `condition` to stream `stream_index` of a running server.
    pub async fn update_condition(
        &self,
        name: &str,
        stream_index: usize,
        condition: &NetworkCondition,
    ) -> anyhow::Result<()> {
        let client = {
            let registry = self.registry();
            let instance = registry
                .instances
                .get(name)
                .ok_or_else(|| OrchestratorError::configuration(format!("unknown server '{name}'")))?;
            if stream_index >= instance.streams.len() {
                return Err(OrchestratorError::configuration(format!(
                    "server '{name}' has no stream {stream_index}"
                )));
            }
            instance.client.clone()
        };

        info!("Updating {} stream {}: {:?}", name, stream_index, condition);
        client.update(stream_index, condition).await?;

        if let Some(instance) = self.registry().instances.get_mut(name) {
            if let Some(stream) = instance.streams.get_mut(stream_index) {
                stream.network = condition.clone();
            }
        }
        Ok(())
    }

    /// Plays `schedule` against one stream for `duration`. Returns how many entries were applied.
    pub async fn run_schedule(
        &self,
        name: &str,
        stream_index: usize,
        schedule: &ConditionSchedule,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<usize> {
        if !self.is_running(name) {
            return Err(OrchestratorError::configuration(format!("unknown server '{name}'")));
        }

        info!(
            "Running {} scheduled conditions on {} stream {} for {:?}",
            schedule.len(),
            name,
            stream_index,
            duration
        );
        run_schedule_with(schedule, duration, cancel, |entry| {
            let condition = entry.condition.clone();
            async move { self.update_condition(name, stream_index, &condition).await }
        })
        .await
    }

    /// Stops the server and forgets it. Returns whether anything was running under `name`.
    pub async fn stop_server(&self, name: &str) -> anyhow::Result<bool> {
        let instance = {
            let mut registry = self.registry();
            let instance = registry.instances.remove(name);
            if let Some(instance) = &instance {
                registry.ports.release(instance.data_port, instance.control_port);
            }
            instance
        };
        match instance {
            Some(instance) => {
                self.shutdown(name, instance).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn shutdown(&self, name: &str, mut instance: ServerInstance) -> anyhow::Result<()> {
        info!("Stopping server {}", name);
        instance.poller_token.cancel();
        if tokio::time::timeout(POLLER_JOIN_TIMEOUT, &mut instance.poller)
            .await
            .is_err()
        {
            debug!("Metrics poller of {} did not stop in time, aborting", name);
            instance.poller.abort();
        }

        self.supervisor.stop(&instance.process_name).await?;
        Ok(())
    }

    /// Stops every server. Safe to call repeatedly.
    pub async fn cleanup_all(&self) -> usize {
        let names: Vec<String> = self.registry().instances.keys().cloned().collect();
        let mut stopped = 0;
        for name in names {
            match self.stop_server(&name).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to stop server {}: {}", name, e),
            }
        }
        stopped
    }

    fn info_of(&self, name: &str, instance: &ServerInstance) -> ServerInfo {
        ServerInfo {
            name: name.to_string(),
            data_port: instance.data_port,
            control_port: instance.control_port,
            streams: instance.streams.clone(),
            urls: self.urls_for(instance.data_port, &instance.streams),
        }
    }

    fn urls_for(&self, data_port: u16, streams: &[StreamConfig]) -> Vec<String> {
        streams
            .iter()
            .map(|stream| {
                format!(
                    "{}://{}:{}/{}",
                    self.settings.scheme,
                    self.settings.host,
                    data_port,
                    stream.mount_path()
                )
            })
            .collect()
    }

    /// Stream URLs built from the port the server was actually started on.
    pub fn get_urls(&self, name: &str) -> anyhow::Result<Vec<String>> {
        let registry = self.registry();
        let instance = registry
            .instances
            .get(name)
            .ok_or_else(|| OrchestratorError::configuration(format!("unknown server '{name}'")))?;
        Ok(self.urls_for(instance.data_port, &instance.streams))
    }

    /// Last metrics snapshot polled from the server.
    pub fn get_metrics(&self, name: &str) -> Option<ServerMetrics> {
        let registry = self.registry();
        let instance = registry.instances.get(name)?;
        let metrics = instance
            .metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        Some(metrics)
    }

    /// Condition most recently applied to a stream.
    pub fn current_condition(&self, name: &str, stream_index: usize) -> Option<NetworkCondition> {
        self.registry()
            .instances
            .get(name)
            .and_then(|instance| instance.streams.get(stream_index))
            .map(|stream| stream.network.clone())
    }

    pub fn server_handle(&self, name: &str) -> Option<ProcessHandle> {
        self.registry()
            .instances
            .get(name)
            .map(|instance| instance.handle.clone())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.registry().instances.contains_key(name)
    }

    pub fn list_servers(&self) -> Vec<ServerInfo> {
        let registry = self.registry();
        let mut servers: Vec<ServerInfo> = registry
            .instances
            .iter()
            .map(|(name, instance)| self.info_of(name, instance))
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }
}

fn spawn_metrics_poller(
    name: String,
    client: ControlClient,
    metrics: Arc<RwLock<ServerMetrics>>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            let polled = tokio::select! {
                _ = token.cancelled() => break,
                polled = async {
                    ticker.tick().await;
                    client.metrics().await
                } => polled,
            };

            match polled {
                Ok(snapshot) => {
                    *metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
                }
                Err(e) => debug!("Metrics poll for {} failed, keeping last snapshot: {}", name, e),
            }
        }
        debug!("Metrics poller for {} stopped", name);
    })
}
