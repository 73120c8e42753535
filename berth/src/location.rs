//! The session root: one [`Location`] per broker.
//!
//! Connecting resolves the broker identity (DNS TXT unless overridden),
//! authenticates the transport, registers the handlers for broker-initiated
//! commands, starts the reactor, and parks until the initial resource offer
//! arrives. Everything else — nodes, tunnels, volumes — hangs off the
//! resulting handle.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use berth_wire::{Message, commands};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::collection::{TaggedCollection, Taggable, valid_tag};
use crate::connection::{BROKER_PORT, Connection, ConnectionBuilder, server_key_from_dns};
use crate::container::Container;
use crate::image::{DockerCli, ImageRuntime};
use crate::keys::{self, KeyPair, decode_key};
use crate::lifecycle::{DeadFlag, Latch, READY_TIMEOUT};
use crate::node::{Node, NodeStats};
use crate::reactor::FrameFn;
use crate::tunnel::Tunnel;
use crate::{Error, Result, upload};

/// Which resource score node ranking prefers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RankBias {
    #[default]
    Cpu,
    Memory,
}

/// An opaque persistent-volume handle offered by the broker, addressable by
/// uuid or tag.
pub struct Volume {
    user: String,
    uuid: String,
    tag: Option<String>,
}

impl Volume {
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

impl Taggable for Volume {
    fn user(&self) -> &str {
        &self.user
    }
    fn uuid(&self) -> &str {
        &self.uuid
    }
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

/// How to reach and authenticate a broker. `Default` reads everything from
/// the on-disk config (`~/.berth`).
pub struct LocationConfig {
    /// Broker FQDN; defaults to the `default_location` file.
    pub location: Option<String>,
    /// Explicit connect address when the FQDN does not resolve here.
    pub location_ip: Option<String>,
    pub port: u16,
    /// Key/config directory override, mostly for tests.
    pub config_dir: Option<PathBuf>,
    /// Broker public key (base64) instead of the DNS TXT lookup.
    pub server_public: Option<String>,
    /// Container runtime override; defaults to the local docker CLI.
    pub runtime: Option<Box<dyn ImageRuntime>>,
}

impl Default for LocationConfig {
    fn default() -> Self {
        LocationConfig {
            location: None,
            location_ip: None,
            port: BROKER_PORT,
            config_dir: None,
            server_public: None,
            runtime: None,
        }
    }
}

#[derive(Default)]
struct LocationState {
    /// Ordered by public key: the broker's offer is a set, this gives it a
    /// stable iteration order.
    nodes: BTreeMap<String, Arc<Node>>,
    /// Last computed ranking plus the round-robin cursor for `best_node`.
    ranked: Vec<Arc<Node>>,
    rotation: usize,
    tunnels: HashMap<String, Arc<Tunnel>>,
    volumes: TaggedCollection<Volume>,
}

pub(crate) struct LocationInner {
    pub(crate) conn: Arc<Connection>,
    fqdn: String,
    runtime: Box<dyn ImageRuntime>,
    ready: Latch,
    dead: DeadFlag,
    state: Mutex<LocationState>,
    weak_self: OnceLock<Weak<LocationInner>>,
}

/// A connected session with a broker.
pub struct Location {
    inner: Arc<LocationInner>,
}

impl Location {
    /// Connect and authenticate, then park until the broker's initial
    /// resource offer marks the session ready.
    pub async fn connect(config: LocationConfig) -> Result<Location> {
        let dir = match config.config_dir {
            Some(dir) => dir,
            None => keys::default_config_dir()?,
        };
        let fqdn = match config.location {
            Some(fqdn) => fqdn,
            None => keys::default_location(&dir)?,
        };
        let keypair = KeyPair::load(&fqdn, &dir)?;
        let server_public = match &config.server_public {
            Some(text) => decode_key(text)?,
            None => server_key_from_dns(&fqdn).await?,
        };

        let connect_addr = config.location_ip.as_deref().unwrap_or(&fqdn).to_owned();
        if config.location_ip.is_some() {
            info!("using explicit broker address: {connect_addr}");
        }
        let mut builder =
            ConnectionBuilder::open(&fqdn, &connect_addr, config.port, &keypair, server_public).await?;

        let inner = Arc::new(LocationInner {
            conn: builder.connection(),
            fqdn,
            runtime: config.runtime.unwrap_or_else(|| Box::new(DockerCli::new())),
            ready: Latch::new(),
            dead: DeadFlag::new(),
            state: Mutex::new(LocationState::default()),
            weak_self: OnceLock::new(),
        });
        inner.weak_self.set(Arc::downgrade(&inner)).ok();
        register_broker_commands(&mut builder, &inner);
        {
            // Transport death fails the session for every current and
            // future waiter, and destruction propagates to the children.
            let weak = Arc::downgrade(&inner);
            builder.on_shutdown(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.dead.mark_as_dead();
                    inner.ready.unblock_and_raise(Error::Disconnected);
                    inner.abandon_resources();
                }
            });
        }
        let conn = builder.start();

        if !inner.ready.wait_until_ready(READY_TIMEOUT).await? {
            conn.stop(true).await;
            return Err(Error::Exhausted("no resource offer arrived from the broker".into()));
        }
        Ok(Location { inner })
    }

    /// The broker FQDN this session talks to.
    pub fn location_name(&self) -> &str {
        &self.inner.fqdn
    }

    /// Our session identity (public key, base64 text).
    pub fn pk(&self) -> &str {
        self.inner.conn.pk()
    }

    /// False once the broker kicked us, the transport died, or
    /// [`Location::disconnect`] ran.
    pub fn is_connected(&self) -> bool {
        !self.inner.dead.is_dead()
    }

    /// The nodes from the last resource offer, in key order.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.inner.state.lock().unwrap().nodes.values().cloned().collect()
    }

    pub fn node(&self, pk: &str) -> Option<Arc<Node>> {
        self.inner.state.lock().unwrap().nodes.get(pk).cloned()
    }

    /// The volumes the broker has offered this user.
    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        self.inner.state.lock().unwrap().volumes.values().cloned().collect()
    }

    /// Look a volume up by `uuid`, `tag`, or `uuid:tag`.
    pub fn volume(&self, key: &str) -> Option<Arc<Volume>> {
        let user = self.inner.conn.pk().to_owned();
        self.inner.state.lock().unwrap().volumes.get(&user, key)
    }

    /// Every live tunnel in the session.
    pub fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.inner.state.lock().unwrap().tunnels.values().cloned().collect()
    }

    /// Push any image layers the broker is missing. Implied by `spawn`
    /// unless disabled there; useful on its own for pre-seeding.
    pub async fn ensure_image_uploaded(&self, image: &str) -> Result<()> {
        self.inner.ensure_image_uploaded(image).await
    }

    /// The nodes sorted by the chosen resource score, best first. Resets the
    /// `best_node` rotation.
    pub async fn ranked_nodes(&self, bias: RankBias) -> Result<Vec<Arc<Node>>> {
        self.inner.wait_ready().await?;
        let mut state = self.inner.state.lock().unwrap();
        let ranked = rank(state.nodes.values().cloned().collect(), bias);
        state.ranked = ranked.clone();
        state.rotation = 0;
        Ok(ranked)
    }

    /// The next node to spawn on: round-robins the last ranking so load
    /// spreads, visiting every node once before repeating.
    pub async fn best_node(&self) -> Result<Arc<Node>> {
        self.inner.wait_ready().await?;
        let mut state = self.inner.state.lock().unwrap();
        if state.ranked.is_empty() {
            state.ranked = rank(state.nodes.values().cloned().collect(), RankBias::default());
            state.rotation = 0;
        }
        if state.ranked.is_empty() {
            return Err(Error::Exhausted("cannot choose a best node: the location has none".into()));
        }
        if state.rotation >= state.ranked.len() {
            state.rotation = 0;
        }
        let node = state.ranked[state.rotation].clone();
        state.rotation += 1;
        Ok(node)
    }

    /// Proxy a local TCP port onto `dest_port` of a container. With no
    /// explicit local port, an unused one is picked at random.
    pub async fn tunnel_onto(
        &self,
        container: &Arc<Container>,
        dest_port: u16,
        localport: Option<u16>,
        bind: Option<IpAddr>,
    ) -> Result<Arc<Tunnel>> {
        self.inner.tunnel_onto(container, dest_port, localport, bind).await
    }

    /// Destroy a tunnel and forget it. Idempotent.
    pub fn destroy_tunnel(&self, tunnel: &Arc<Tunnel>) {
        self.inner.state.lock().unwrap().tunnels.remove(tunnel.uuid());
        tunnel.internal_destroy();
    }

    /// Attach a tunnel and poll `http://fqdn:localport/path` until it
    /// answers 200 (up to 60 tries at half-second intervals).
    pub async fn wait_http_200(
        &self,
        container: &Arc<Container>,
        dest_port: u16,
        fqdn: &str,
        path: &str,
    ) -> Result<Arc<Tunnel>> {
        self.inner.wait_http_200(container, dest_port, fqdn, path).await
    }

    /// End the session: every node (with its containers and processes) is
    /// abandoned, tunnels come down, the transport stops. Idempotent; every
    /// subsequent resource operation fails.
    pub async fn disconnect(&self) {
        if !self.inner.dead.mark_as_dead() {
            return;
        }
        self.inner.ready.unblock_and_raise(Error::Disconnected);
        self.inner.abandon_resources();
        self.inner.conn.stop(true).await;
        info!("disconnected from: {}", self.inner.fqdn);
    }
}

impl std::fmt::Debug for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Location")
            .field("fqdn", &self.inner.fqdn)
            .field("nodes", &self.inner.state.lock().unwrap().nodes.len())
            .finish_non_exhaustive()
    }
}

fn rank(mut nodes: Vec<Arc<Node>>, bias: RankBias) -> Vec<Arc<Node>> {
    nodes.sort_by(|a, b| {
        let (a, b) = match bias {
            RankBias::Cpu => (a.stats().cpu, b.stats().cpu),
            RankBias::Memory => (a.stats().memory, b.stats().memory),
        };
        b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
    });
    nodes
}

impl LocationInner {
    fn weak(&self) -> Weak<LocationInner> {
        self.weak_self.get().cloned().unwrap_or_default()
    }

    /// Session death propagates to the children: every node is abandoned
    /// (containers die, processes get their termination callbacks, waiters
    /// are released) and every tunnel is torn down.
    fn abandon_resources(&self) {
        let (nodes, tunnels) = {
            let mut state = self.state.lock().unwrap();
            state.ranked.clear();
            state.rotation = 0;
            let nodes: Vec<Arc<Node>> = state.nodes.values().cloned().collect();
            state.nodes.clear();
            let tunnels: Vec<Arc<Tunnel>> =
                state.tunnels.drain().map(|(_, tunnel)| tunnel).collect();
            (nodes, tunnels)
        };
        for node in nodes {
            node.abandon();
        }
        for tunnel in tunnels {
            tunnel.internal_destroy();
        }
    }

    /// Gate for resource operations: alive, and the offer has arrived.
    pub(crate) async fn wait_ready(&self) -> Result<()> {
        self.dead.ensure_alive("location")?;
        if self.ready.wait_until_ready(READY_TIMEOUT).await? {
            Ok(())
        } else {
            Err(Error::Exhausted("no resource offer arrived from the broker".into()))
        }
    }

    pub(crate) fn runtime(&self) -> &dyn ImageRuntime {
        self.runtime.as_ref()
    }

    pub(crate) async fn ensure_image_uploaded(&self, image: &str) -> Result<()> {
        self.wait_ready().await?;
        upload::ensure_image_uploaded(&self.conn, self.runtime.as_ref(), image).await
    }

    pub(crate) async fn tunnel_onto(
        &self,
        container: &Arc<Container>,
        dest_port: u16,
        localport: Option<u16>,
        bind: Option<IpAddr>,
    ) -> Result<Arc<Tunnel>> {
        self.wait_ready().await?;
        // The container must be up or its IP does not exist on the node yet
        // and remote tunnel creation would fail.
        container.ready_or_fail().await?;

        let bind = bind.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (listener, localport) = bind_local_listener(bind, localport).await?;
        let tunnel = Tunnel::new(
            self.conn.clone(),
            container.node_pk().to_owned(),
            container.uuid().to_owned(),
            dest_port,
            localport,
            listener,
        );
        // Registered before `create_tunnel` goes out, so `tunnel_up` cannot
        // arrive for an unknown tunnel.
        self.state.lock().unwrap().tunnels.insert(tunnel.uuid().to_owned(), tunnel.clone());
        tunnel.connect()?;
        Ok(tunnel)
    }

    pub(crate) async fn wait_http_200(
        &self,
        container: &Arc<Container>,
        dest_port: u16,
        fqdn: &str,
        path: &str,
    ) -> Result<Arc<Tunnel>> {
        info!("waiting on http 200: {}", container.uuid());
        let tunnel = self.tunnel_onto(container, dest_port, None, None).await?;
        if !tunnel.wait_until_ready().await? {
            return Err(Error::Exhausted(format!("tunnel {} did not come up", tunnel.uuid())));
        }

        let localport = tunnel.localport();
        let client = reqwest::Client::builder()
            .resolve(fqdn, SocketAddr::from(([127, 0, 0, 1], localport)))
            .build()
            .map_err(|err| Error::Transport(format!("cannot build an http client: {err}")))?;
        let url = format!("http://{fqdn}:{localport}/{}", path.trim_start_matches('/'));
        for _ in 0..60 {
            if let Ok(response) = client.get(&url).send().await {
                if response.status() == reqwest::StatusCode::OK {
                    info!("connected onto: {url}");
                    return Ok(tunnel);
                }
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(Error::Exhausted(format!("could not connect to: {url}")))
    }

    pub(crate) fn tunnels_for(&self, container_uuid: &str) -> Vec<Arc<Tunnel>> {
        self.state
            .lock()
            .unwrap()
            .tunnels
            .values()
            .filter(|tunnel| tunnel.container_uuid() == container_uuid)
            .cloned()
            .collect()
    }

    pub(crate) fn destroy_tunnels_for(&self, container_uuid: &str) {
        let doomed: Vec<Arc<Tunnel>> = {
            let mut state = self.state.lock().unwrap();
            let uuids: Vec<String> = state
                .tunnels
                .values()
                .filter(|tunnel| tunnel.container_uuid() == container_uuid)
                .map(|tunnel| tunnel.uuid().to_owned())
                .collect();
            uuids.iter().filter_map(|uuid| state.tunnels.remove(uuid)).collect()
        };
        for tunnel in doomed {
            tunnel.internal_destroy();
        }
    }

    // Broker-initiated commands.

    fn resource_offer(&self, msg: &Message) {
        debug!("location has sent a resource offer");
        {
            let mut state = self.state.lock().unwrap();
            if let Some(nodes) = msg.params.get("nodes").and_then(Value::as_array) {
                if nodes.is_empty() {
                    warn!("the resource offer did not include any nodes; nothing can run here");
                }
                let mut fresh: BTreeMap<String, Arc<Node>> = BTreeMap::new();
                for entry in nodes {
                    let Some(map) = entry.as_object() else { continue };
                    for (pk, stats) in map {
                        let stats: NodeStats =
                            serde_json::from_value(stats.clone()).unwrap_or_default();
                        match state.nodes.get(pk) {
                            Some(node) => {
                                node.update_stats(stats);
                                fresh.insert(pk.clone(), node.clone());
                            }
                            None => {
                                fresh.insert(
                                    pk.clone(),
                                    Node::new(pk.clone(), self.conn.clone(), self.weak(), stats),
                                );
                            }
                        }
                    }
                }
                for (pk, node) in &state.nodes {
                    if !fresh.contains_key(pk) {
                        warn!("node has left the location: {pk}");
                        node.abandon();
                    }
                }
                state.nodes = fresh;
                state.ranked.clear();
                state.rotation = 0;
            }

            if let Some(volumes) = msg.params.get("volumes").and_then(Value::as_array) {
                for offered in volumes {
                    let Some(uuid) = offered.get("uuid").and_then(Value::as_str) else {
                        continue;
                    };
                    if state.volumes.by_uuid(uuid).is_some() {
                        continue;
                    }
                    let tag = offered
                        .get("tag")
                        .and_then(Value::as_str)
                        .and_then(|tag| valid_tag(tag).ok());
                    let volume = Arc::new(Volume {
                        user: self.conn.pk().to_owned(),
                        uuid: uuid.to_owned(),
                        tag,
                    });
                    if let Err(err) = state.volumes.add(volume) {
                        warn!("ignoring an offered volume: {err}");
                    }
                }
            }
        }
        self.ready.mark_as_ready();
    }

    fn tunnel_up(&self, msg: &Message) {
        match self.state.lock().unwrap().tunnels.get(&msg.id) {
            Some(tunnel) => tunnel.tunnel_up(),
            None => warn!("tunnel_up for an unknown tunnel: {}", msg.id),
        }
    }

    fn from_proxy(&self, msg: &Message) {
        let tunnel = self.state.lock().unwrap().tunnels.get(&msg.id).cloned();
        match tunnel {
            Some(tunnel) => tunnel.from_proxy(msg),
            // Torn down while the frame was in flight.
            None => debug!("from_proxy for an unknown tunnel: {}", msg.id),
        }
    }

    fn close_proxy(&self, msg: &Message) {
        let tunnel = self.state.lock().unwrap().tunnels.get(&msg.id).cloned();
        let Some(token) = msg.param_u64("proxy") else { return };
        match tunnel {
            Some(tunnel) => tunnel.close_proxy(token),
            None => debug!("close_proxy for an unknown tunnel: {}", msg.id),
        }
    }

    fn log(&self, msg: &Message) {
        let line = msg.param_str("log").unwrap_or_default();
        if msg.params.get("error").and_then(Value::as_bool).unwrap_or(false) {
            error!("broker: {line}");
        } else {
            info!("broker: {line}");
        }
    }

    fn kicked(&self) {
        warn!("another session holds this identity now; terminating");
        self.dead.mark_as_dead();
        self.ready.unblock_and_raise(Error::Disconnected);
        // Children are dead too: termination callbacks fire right here on
        // the reactor task, before any handle goes invalid.
        self.abandon_resources();
        self.conn.request_stop();
    }
}

/// The statically-declared table of broker-initiated commands.
fn register_broker_commands(builder: &mut ConnectionBuilder, inner: &Arc<LocationInner>) {
    fn hook(
        inner: &Arc<LocationInner>,
        f: impl Fn(&Arc<LocationInner>, &Message) + Send + 'static,
    ) -> FrameFn {
        let weak = Arc::downgrade(inner);
        Box::new(move |msg| {
            if let Some(inner) = weak.upgrade() {
                f(&inner, msg);
            }
        })
    }

    builder.register_command(
        commands::RESOURCE_OFFER,
        &[],
        false,
        hook(inner, |inner, msg| inner.resource_offer(msg)),
    );
    builder.register_command(
        commands::TUNNEL_UP,
        &[],
        false,
        hook(inner, |inner, msg| inner.tunnel_up(msg)),
    );
    builder.register_command(
        commands::FROM_PROXY,
        &["proxy"],
        false,
        hook(inner, |inner, msg| inner.from_proxy(msg)),
    );
    builder.register_command(
        commands::CLOSE_PROXY,
        &["proxy"],
        false,
        hook(inner, |inner, msg| inner.close_proxy(msg)),
    );
    builder.register_command(
        commands::LOG,
        &["error", "log"],
        false,
        hook(inner, |inner, msg| inner.log(msg)),
    );
    builder.register_command(
        commands::KICKED,
        &[],
        false,
        hook(inner, |inner, _msg| inner.kicked()),
    );
}

/// Bind the tunnel's local listener: an explicit port must work first try, a
/// free one is probed at random out of 1025–8192 (what the OS reports in use
/// fails the bind and we move on).
async fn bind_local_listener(bind: IpAddr, localport: Option<u16>) -> Result<(TcpListener, u16)> {
    if let Some(port) = localport {
        let listener = TcpListener::bind((bind, port))
            .await
            .map_err(|err| Error::Exhausted(format!("cannot bind local port {port}: {err}")))?;
        return Ok((listener, port));
    }
    for _ in 0..32 {
        let port: u16 = rand::thread_rng().gen_range(1025..8192);
        if let Ok(listener) = TcpListener::bind((bind, port)).await {
            return Ok((listener, port));
        }
    }
    Err(Error::Exhausted("could not find an unused local port".into()))
}
