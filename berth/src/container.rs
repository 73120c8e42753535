//! A remote container handle: file I/O, processes, firewall, tunnels.
//!
//! Every operation gates on the readiness latch (released when the broker
//! reports the container running and assigns its private IP) and on the dead
//! flag. Streaming process frames land here first, keyed by the correlation
//! id of the `spawn_process` command, and are fanned out to the owning
//! [`Process`].

use std::collections::HashMap;
use std::path::Component;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use berth_wire::{Message, commands};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::lifecycle::{DeadFlag, IMAGE_READY_TIMEOUT, Latch};
use crate::location::LocationInner;
use crate::node::Node;
use crate::process::{DataCallback, Process, TerminationCallback};
use crate::reactor::FrameFn;
use crate::tunnel::Tunnel;
use crate::{Error, Result, ids};

/// One line of a container's collected stdout/stderr log.
#[derive(Clone, Debug, Deserialize)]
pub struct LogEntry {
    pub log: String,
    pub stream: String,
    /// Server timestamp, passed through as the broker sent it.
    #[serde(default)]
    pub time: Value,
}

pub struct Container {
    uuid: String,
    image: String,
    node_pk: String,
    conn: Arc<Connection>,
    location: Weak<LocationInner>,
    node: Weak<Node>,
    docker_config: Value,
    env: Vec<(String, String)>,
    ip: Mutex<Option<String>>,
    ready: Latch,
    dead: DeadFlag,
    processes: Mutex<HashMap<String, Arc<Process>>>,
    /// Peers allowed to connect to this container, referenced not owned.
    allowed: Mutex<HashMap<String, Weak<Container>>>,
    weak_self: OnceLock<Weak<Container>>,
}

impl Container {
    #[expect(clippy::too_many_arguments, reason = "internal constructor, built in one place")]
    pub(crate) fn new(
        conn: Arc<Connection>,
        location: Weak<LocationInner>,
        node: Weak<Node>,
        node_pk: String,
        image: String,
        uuid: String,
        docker_config: Value,
        env: Vec<(String, String)>,
    ) -> Arc<Container> {
        let container = Arc::new(Container {
            uuid,
            image,
            node_pk,
            conn,
            location,
            node,
            docker_config,
            env,
            ip: Mutex::new(None),
            ready: Latch::new(),
            dead: DeadFlag::new(),
            processes: Mutex::new(HashMap::new()),
            allowed: Mutex::new(HashMap::new()),
            weak_self: OnceLock::new(),
        });
        container.weak_self.set(Arc::downgrade(&container)).ok();
        container
    }

    fn strong(&self) -> Result<Arc<Container>> {
        self.weak_self.get().and_then(Weak::upgrade).ok_or(Error::Disconnected)
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn node_pk(&self) -> &str {
        &self.node_pk
    }

    /// The boot configuration derived from image metadata.
    pub fn docker_config(&self) -> &Value {
        &self.docker_config
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Block up to the image-bearing timeout for the spawn to complete.
    /// `Ok(false)` means still spawning; a broker exception re-raises here.
    pub async fn wait_until_ready(&self) -> Result<bool> {
        self.ready.wait_until_ready(IMAGE_READY_TIMEOUT).await
    }

    /// Readiness as a hard gate, for the operations below.
    pub(crate) async fn ready_or_fail(&self) -> Result<()> {
        if self.ready.wait_until_ready(IMAGE_READY_TIMEOUT).await? {
            Ok(())
        } else {
            Err(Error::Exhausted(format!("container {} did not become ready", self.uuid)))
        }
    }

    /// The container's private IP. Assigned once, when the broker reports
    /// the container running; blocks on readiness first.
    pub async fn ip(&self) -> Result<String> {
        self.dead.ensure_alive("container")?;
        self.ready_or_fail().await?;
        self.ip
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::State(format!("container {} is running but has no ip", self.uuid)))
    }

    /// Fetch a single file. The whole file lands in memory, so this is not
    /// the way to move anything huge.
    pub async fn fetch(&self, filename: &str) -> Result<Bytes> {
        self.dead.ensure_alive("container")?;
        self.ready_or_fail().await?;
        let reply = self
            .conn
            .send_blocking(
                commands::FETCH,
                json!({
                    "node": self.node_pk,
                    "container": self.uuid,
                    "filename": filename,
                }),
                Bytes::new(),
            )
            .await?;
        Ok(reply.bulk)
    }

    /// Write a file, creating intermediate directories. Overwrites silently.
    /// Paths that try to escape upwards are rejected before anything is sent.
    pub async fn put(&self, filename: &str, data: impl Into<Bytes>) -> Result<()> {
        self.dead.ensure_alive("container")?;
        if std::path::Path::new(filename)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::State(format!("path may not escape upwards: {filename}")));
        }
        self.ready_or_fail().await?;
        self.conn
            .send_blocking(
                commands::PUT,
                json!({
                    "node": self.node_pk,
                    "container": self.uuid,
                    "filename": filename,
                }),
                data,
            )
            .await?;
        Ok(())
    }

    /// The boot log as structured entries (newline-delimited JSON upstream).
    pub async fn logs(&self) -> Result<Vec<LogEntry>> {
        self.dead.ensure_alive("container")?;
        self.ready_or_fail().await?;
        let reply = self
            .conn
            .send_blocking(
                commands::FETCH_LOG,
                json!({ "node": self.node_pk, "container": self.uuid }),
                Bytes::new(),
            )
            .await?;
        let text = String::from_utf8_lossy(&reply.bulk);
        text.lines()
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| Error::Transport(format!("undecodable log line: {err}")))
            })
            .collect()
    }

    /// Launch a process inside the container; its output streams back on the
    /// reactor task. With no data callback the output accumulates for
    /// [`Process::wait_until_complete`].
    pub async fn spawn_process(
        &self,
        command: impl IntoIterator<Item = impl Into<String>>,
        data_callback: Option<DataCallback>,
        termination_callback: Option<TerminationCallback>,
    ) -> Result<Arc<Process>> {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        info!("container ({}) spawning process: {:?}", self.uuid, command);
        self.spawn_process_inner(Some(command), data_callback, termination_callback).await
    }

    /// Launch the server-default shell (no explicit command).
    pub async fn spawn_shell(
        &self,
        data_callback: Option<DataCallback>,
        termination_callback: Option<TerminationCallback>,
    ) -> Result<Arc<Process>> {
        info!("container ({}) spawning shell", self.uuid);
        self.spawn_process_inner(None, data_callback, termination_callback).await
    }

    async fn spawn_process_inner(
        &self,
        command: Option<Vec<String>>,
        data_callback: Option<DataCallback>,
        termination_callback: Option<TerminationCallback>,
    ) -> Result<Arc<Process>> {
        self.dead.ensure_alive("container")?;
        self.ready_or_fail().await?;

        // The correlation id of the spawn command names the process for its
        // whole life; allocate it first so the handle exists before any
        // frame can come back.
        let uuid = ids::new_id();
        let process = Process::new(
            self.conn.clone(),
            self.node_pk.clone(),
            self.uuid.clone(),
            uuid.clone(),
            data_callback,
            termination_callback,
        );
        self.processes.lock().unwrap().insert(uuid.clone(), process.clone());

        let dispatcher: FrameFn = {
            let weak = self.weak_self.get().cloned().unwrap_or_default();
            Box::new(move |msg| {
                if let Some(container) = weak.upgrade() {
                    container.process_frame(msg);
                }
            })
        };
        let mut params = json!({ "node": self.node_pk, "container": self.uuid });
        if let Some(command) = command {
            params["command"] = json!(command);
        }
        self.conn.register_stream(&uuid, dispatcher)?;
        self.conn.send_with_id(commands::SPAWN_PROCESS, &uuid, params, Bytes::new())?;
        Ok(process)
    }

    /// One frame of some process's streaming conversation.
    pub(crate) fn process_frame(&self, msg: &Message) {
        if self.dead.bail_if_dead("container") {
            return;
        }
        if msg.is_sentinel() {
            info!("process terminated: {}", msg.id);
            self.processes.lock().unwrap().remove(&msg.id);
            return;
        }
        let process = self.processes.lock().unwrap().get(&msg.id).cloned();
        match process {
            Some(process) => process.handle_frame(msg),
            // Probably a late frame for a process we just destroyed.
            None => debug!("frame arrived for an unknown process: {}", msg.id),
        }
    }

    /// Destroy one process (and tell the broker). The termination callback
    /// fires locally, exactly once.
    pub fn destroy_process(&self, process: &Arc<Process>) -> Result<()> {
        self.dead.ensure_alive("container")?;
        let removed = self.processes.lock().unwrap().remove(process.uuid());
        if removed.is_none() {
            return Err(Error::State("process does not belong to this container".into()));
        }
        process.internal_destroy(true);
        Ok(())
    }

    /// Every process launched through this handle and still alive.
    pub fn all_processes(&self) -> Vec<Arc<Process>> {
        self.processes.lock().unwrap().values().cloned().collect()
    }

    /// A TCP tunnel from the local machine onto a port of this container.
    pub async fn attach_tunnel(
        &self,
        dest_port: u16,
        localport: Option<u16>,
        bind: Option<std::net::IpAddr>,
    ) -> Result<Arc<Tunnel>> {
        self.dead.ensure_alive("container")?;
        let location = self.location().ok_or(Error::Disconnected)?;
        location.tunnel_onto(&self.strong()?, dest_port, localport, bind).await
    }

    /// Attach a tunnel and poll until the container answers HTTP 200.
    pub async fn wait_http_200(
        &self,
        dest_port: u16,
        fqdn: &str,
        path: &str,
    ) -> Result<Arc<Tunnel>> {
        self.dead.ensure_alive("container")?;
        let location = self.location().ok_or(Error::Disconnected)?;
        location.wait_http_200(&self.strong()?, dest_port, fqdn, path).await
    }

    /// Every tunnel this session holds onto this container.
    pub fn all_tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.location()
            .map(|location| location.tunnels_for(&self.uuid))
            .unwrap_or_default()
    }

    /// Allow another container to connect to this one over the private
    /// network. Allowing an already-allowed peer (or this container itself)
    /// is a silent no-op.
    pub async fn allow_connection_from(&self, peer: &Arc<Container>) -> Result<()> {
        self.dead.ensure_alive("container")?;
        self.ready_or_fail().await?;
        if peer.uuid == self.uuid || self.allowed.lock().unwrap().contains_key(&peer.uuid) {
            warn!("container is already allowed to connect: {}", peer.uuid);
            return Ok(());
        }
        let peer_ip = peer.ip().await?;
        self.conn
            .send_blocking(
                commands::ALLOW_CONNECTION,
                json!({
                    "node": self.node_pk,
                    "container": self.uuid,
                    "ip": peer_ip,
                }),
                Bytes::new(),
            )
            .await?;
        self.allowed.lock().unwrap().insert(peer.uuid.clone(), Arc::downgrade(peer));
        info!("allowed connection (from {}) on: {}", peer.uuid, self.uuid);
        Ok(())
    }

    /// Inverse of [`Container::allow_connection_from`]; also idempotent.
    pub async fn disallow_connection_from(&self, peer: &Arc<Container>) -> Result<()> {
        self.dead.ensure_alive("container")?;
        if self.allowed.lock().unwrap().remove(&peer.uuid).is_none() {
            warn!("container is already not allowed to connect: {}", peer.uuid);
            return Ok(());
        }
        let peer_ip = peer.ip().await?;
        self.conn
            .send_blocking(
                commands::DISALLOW_CONNECTION,
                json!({
                    "node": self.node_pk,
                    "container": self.uuid,
                    "ip": peer_ip,
                }),
                Bytes::new(),
            )
            .await?;
        info!("disallowed connection (from {}) on: {}", peer.uuid, self.uuid);
        Ok(())
    }

    /// The peers currently on the allow-list (and still alive locally).
    pub fn all_allowed_connections(&self) -> Vec<Arc<Container>> {
        self.allowed.lock().unwrap().values().filter_map(Weak::upgrade).collect()
    }

    /// The node this container runs on, while the session lasts.
    pub fn node(&self) -> Option<Arc<Node>> {
        self.node.upgrade()
    }

    fn location(&self) -> Option<Arc<LocationInner>> {
        self.location.upgrade()
    }

    /// The broker says the container is up: pin the IP (first write wins)
    /// and release everyone parked on readiness.
    pub(crate) fn status_running(&self, ip: String) {
        let mut slot = self.ip.lock().unwrap();
        if slot.is_none() {
            *slot = Some(ip);
        }
        drop(slot);
        self.ready.mark_as_ready();
    }

    /// The spawn failed remotely; waiters re-raise this.
    pub(crate) fn status_failed(&self, err: Error) {
        self.ready.unblock_and_raise(err);
    }

    /// Tear down: children first (their callbacks fire locally, the broker
    /// will kill the real processes along with the container), then tunnels,
    /// then the remote container itself.
    pub(crate) async fn internal_destroy(&self, with_command: bool) -> Result<()> {
        if self.dead.bail_if_dead("container") {
            return Ok(());
        }
        self.ready_or_fail().await.ok(); // a failed spawn can still be destroyed
        self.dead.mark_as_dead();

        let processes: Vec<Arc<Process>> =
            self.processes.lock().unwrap().drain().map(|(_, process)| process).collect();
        for process in processes {
            process.internal_destroy(false);
        }
        if let Some(location) = self.location() {
            location.destroy_tunnels_for(&self.uuid);
        }
        if with_command {
            self.conn.send_cmd(
                commands::DESTROY_CONTAINER,
                json!({ "node": self.node_pk, "container": self.uuid }),
                Bytes::new(),
            )?;
        }
        info!("destroyed container: {}", self.uuid);
        Ok(())
    }

    /// The node vanished from a resource offer: everything local dies
    /// quietly, nothing is sent.
    pub(crate) fn abandon(&self) {
        if !self.dead.mark_as_dead() {
            return;
        }
        let processes: Vec<Arc<Process>> =
            self.processes.lock().unwrap().drain().map(|(_, process)| process).collect();
        for process in processes {
            process.internal_destroy(false);
        }
        self.ready.unblock_and_raise(Error::Disconnected);
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("uuid", &self.uuid)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}
