//! A worker node: spawns containers and tracks the ones this session owns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use berth_wire::{Message, commands};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::container::Container;
use crate::image::layer_stack;
use crate::location::LocationInner;
use crate::reactor::FrameFn;
use crate::{Error, Result, ids};

/// Live resource scores from the latest offer, used for ranking. Values are
/// normalized by the broker (cpu is in passmarks, so differing processor
/// generations compare honestly).
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct NodeStats {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub memory: f64,
}

/// What [`Node::spawn`] should do beyond booting the image as-is.
#[derive(Default)]
pub struct SpawnOptions {
    /// Environment name/value pairs, in order.
    pub env: Vec<(String, String)>,
    /// Replace the entrypoint with an indefinite sleep (the container boots
    /// but runs nothing).
    pub sleep: bool,
    /// Files written into the container before it boots, path → contents.
    pub pre_boot_files: Vec<(String, Bytes)>,
    /// Skip the layer-upload check (the image is known to be on the broker).
    pub no_image_check: bool,
}

/// Handle onto one worker. Not constructed directly: nodes appear in the
/// broker's resource offer, via `ranked_nodes`/`best_node` on the location.
pub struct Node {
    pk: String,
    conn: Arc<Connection>,
    location: Weak<LocationInner>,
    stats: Mutex<NodeStats>,
    containers: Mutex<HashMap<String, Arc<Container>>>,
    weak_self: OnceLock<Weak<Node>>,
}

impl Node {
    pub(crate) fn new(
        pk: String,
        conn: Arc<Connection>,
        location: Weak<LocationInner>,
        stats: NodeStats,
    ) -> Arc<Node> {
        let node = Arc::new(Node {
            pk,
            conn,
            location,
            stats: Mutex::new(stats),
            containers: Mutex::new(HashMap::new()),
            weak_self: OnceLock::new(),
        });
        node.weak_self.set(Arc::downgrade(&node)).ok();
        node
    }

    fn weak(&self) -> Weak<Node> {
        self.weak_self.get().cloned().unwrap_or_default()
    }

    /// The node's public key: its identity within the location.
    pub fn pk(&self) -> &str {
        &self.pk
    }

    pub fn stats(&self) -> NodeStats {
        *self.stats.lock().unwrap()
    }

    pub(crate) fn update_stats(&self, stats: NodeStats) {
        *self.stats.lock().unwrap() = stats;
        debug!("stats updated for node: {}", self.pk);
    }

    /// Asynchronously spawn a container on this node. The returned handle is
    /// a placeholder until the broker reports it running; call
    /// [`Container::wait_until_ready`](crate::Container::wait_until_ready) to
    /// block for that. Missing image layers are uploaded first unless
    /// disabled.
    pub async fn spawn(&self, image: &str, options: SpawnOptions) -> Result<Arc<Container>> {
        let location = self.location.upgrade().ok_or(Error::Disconnected)?;
        if !options.no_image_check {
            location.ensure_image_uploaded(image).await?;
        }

        let mut descr = location.runtime().describe(image).await?;
        descr.strip_container_config();
        if options.sleep {
            descr.sleep_override();
        }
        let stack = layer_stack(&descr);

        // Pre-boot file contents ride in params, so they go as base64 text.
        let pre_boot: Map<String, Value> = options
            .pre_boot_files
            .iter()
            .map(|(name, data)| (name.clone(), Value::String(BASE64.encode(data))))
            .collect();

        let uuid = ids::new_id();
        let container = Container::new(
            self.conn.clone(),
            self.location.clone(),
            self.weak(),
            self.pk.clone(),
            image.to_owned(),
            uuid.clone(),
            serde_json::to_value(&descr)
                .map_err(|err| Error::Configuration(format!("unserializable description: {err}")))?,
            options.env.clone(),
        );
        self.containers.lock().unwrap().insert(uuid.clone(), container.clone());

        // Status updates stream back under the spawn's correlation id.
        let updates: FrameFn = {
            let weak = self.weak();
            Box::new(move |msg| {
                if let Some(node) = weak.upgrade() {
                    node.container_status_update(msg);
                }
            })
        };
        self.conn.register_stream(&uuid, updates)?;
        self.conn.send_with_id(
            commands::SPAWN_CONTAINER,
            &uuid,
            json!({
                "node": self.pk,
                "layer_stack": stack,
                "description": container.docker_config(),
                "env": options.env,
                "pre_boot_files": pre_boot,
            }),
            Bytes::new(),
        )?;
        info!("spawning container: {uuid}");
        Ok(container)
    }

    /// A `spawn_container` status frame: run/fail transitions for one of our
    /// containers.
    fn container_status_update(&self, msg: &Message) {
        if msg.is_sentinel() {
            return;
        }
        let container = self.containers.lock().unwrap().get(&msg.id).cloned();
        let Some(container) = container else {
            warn!("status update for an unknown container: {}", msg.id);
            return;
        };
        if let Some(exception) = msg.exception() {
            container.status_failed(Error::Remote(exception.to_owned()));
            return;
        }
        if msg.param_str("status") == Some("running") {
            info!("container is running: {}", msg.id);
            container.status_running(msg.param_str("ip").unwrap_or_default().to_owned());
        }
    }

    /// Destroy a container this session spawned. Child processes get their
    /// termination callbacks locally; the broker tears down the real thing.
    pub async fn destroy_container(&self, container: &Arc<Container>) -> Result<()> {
        let held = self.containers.lock().unwrap().contains_key(container.uuid());
        if !held {
            return Err(Error::State("container does not belong to this node".into()));
        }
        container.internal_destroy(true).await?;
        self.containers.lock().unwrap().remove(container.uuid());
        // The spawn's status route has nothing left to update.
        self.conn.unregister_reply(container.uuid());
        Ok(())
    }

    /// The containers this session spawned here (other sessions' containers
    /// on the node are invisible).
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.containers.lock().unwrap().values().cloned().collect()
    }

    /// The whole node went away: abandon every local handle.
    pub(crate) fn abandon(&self) {
        for (uuid, container) in self.containers.lock().unwrap().drain() {
            container.abandon();
            self.conn.unregister_reply(&uuid);
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("pk", &self.pk)
            .field("containers", &self.containers.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}
