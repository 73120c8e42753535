//! The TCP tunnel engine.
//!
//! A tunnel is a local listener whose accepted connections ("proxies") are
//! carried as framed messages over the one control transport to a single
//! port on a single remote container. Each proxy gets a token unique across
//! the whole process (one shared counter, so tokens can never collide across
//! tunnels), a reader task that forwards chunks of at most 128 KiB as
//! `to_proxy` frames, and a writer fed by `from_proxy` frames. Either side
//! closing sends/honors `close_proxy`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use berth_wire::{Message, commands};
use bytes::Bytes;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::lifecycle::{DeadFlag, Latch, READY_TIMEOUT};
use crate::{Result, ids};

/// Hard cap on one proxied read, and so on one `to_proxy` frame.
const PROXY_READ_CAP: usize = 128 * 1024;

/// Proxy tokens: process-wide so no two tunnels can ever hand the broker the
/// same token (the property fds gave the original design for free).
static NEXT_PROXY_TOKEN: AtomicU64 = AtomicU64::new(1);

enum ProxyOp {
    Data(Bytes),
    Shutdown,
}

struct Proxy {
    ops: mpsc::UnboundedSender<ProxyOp>,
    /// Set just after spawn; the entry itself goes into the map first so the
    /// reader can never observe an unregistered token.
    reader: OnceLock<JoinHandle<()>>,
}

impl Proxy {
    fn shut_down(&self) {
        let _ = self.ops.send(ProxyOp::Shutdown);
        if let Some(reader) = self.reader.get() {
            reader.abort();
        }
    }
}

/// A local listener proxied onto one remote container port. Constructed via
/// the location (`tunnel_onto` / `attach_tunnel`), never directly.
pub struct Tunnel {
    uuid: String,
    node_pk: String,
    container_uuid: String,
    port: u16,
    localport: u16,
    conn: Arc<Connection>,
    ready: Latch,
    dead: DeadFlag,
    listener: Mutex<Option<TcpListener>>,
    proxies: Mutex<HashMap<u64, Proxy>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: OnceLock<Weak<Tunnel>>,
}

impl Tunnel {
    pub(crate) fn new(
        conn: Arc<Connection>,
        node_pk: String,
        container_uuid: String,
        port: u16,
        localport: u16,
        listener: TcpListener,
    ) -> Arc<Tunnel> {
        let tunnel = Arc::new(Tunnel {
            uuid: ids::new_id(),
            node_pk,
            container_uuid,
            port,
            localport,
            conn,
            ready: Latch::new(),
            dead: DeadFlag::new(),
            listener: Mutex::new(Some(listener)),
            proxies: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            weak_self: OnceLock::new(),
        });
        tunnel.weak_self.set(Arc::downgrade(&tunnel)).ok();
        tunnel
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The local port to point clients at.
    pub fn localport(&self) -> u16 {
        self.localport
    }

    /// The destination port on the container.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn container_uuid(&self) -> &str {
        &self.container_uuid
    }

    /// Live proxied connections (accepted and not yet closed by either end).
    pub fn proxy_count(&self) -> usize {
        self.proxies.lock().unwrap().len()
    }

    /// Up once the broker has built its end (`tunnel_up`). `Ok(false)` is a
    /// timeout; the tunnel keeps listening and can be polled again.
    pub async fn wait_until_ready(&self) -> Result<bool> {
        self.ready.wait_until_ready(READY_TIMEOUT).await
    }

    /// Start accepting locally and ask the broker to build the remote end.
    /// Called only after the tunnel is registered with the location, so the
    /// `tunnel_up` reply cannot race past us.
    pub(crate) fn connect(&self) -> Result<()> {
        let listener = self.listener.lock().unwrap().take().expect("connect called once");
        let tunnel = self
            .weak_self
            .get()
            .and_then(Weak::upgrade)
            .expect("constructed through Tunnel::new");
        let task = tokio::spawn(async move { tunnel.accept_loop(listener).await });
        *self.accept_task.lock().unwrap() = Some(task);

        debug!("creating tunnel: {}", self.uuid);
        self.conn.send_with_id(
            commands::CREATE_TUNNEL,
            &self.uuid,
            json!({
                "tunnel": self.uuid,
                "node": self.node_pk,
                "container": self.container_uuid,
                "port": self.port,
            }),
            Bytes::new(),
        )
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    stream.set_nodelay(true).ok();
                    let token = NEXT_PROXY_TOKEN.fetch_add(1, Ordering::Relaxed);
                    let (read_half, write_half) = stream.into_split();
                    let (ops_tx, ops_rx) = mpsc::unbounded_channel();
                    tokio::spawn(run_writer(write_half, ops_rx));
                    self.proxies
                        .lock()
                        .unwrap()
                        .insert(token, Proxy { ops: ops_tx, reader: OnceLock::new() });
                    let reader = tokio::spawn(run_reader(self.clone(), read_half, token));
                    match self.proxies.lock().unwrap().get(&token) {
                        Some(proxy) => {
                            proxy.reader.set(reader).ok();
                        }
                        // Torn down again already.
                        None => reader.abort(),
                    }
                    debug!("accepted proxy connection: {token}");
                }
                Err(err) => {
                    // Transient (EAGAIN and friends): back off and retry.
                    warn!("tunnel accept failed, retrying: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// The broker built its end: release waiters.
    pub(crate) fn tunnel_up(&self) {
        info!("tunnel up: {} ({} -> {})", self.uuid, self.localport, self.port);
        self.ready.mark_as_ready();
    }

    /// Bytes from the container, addressed to one proxy. Unknown tokens are
    /// dropped: the proxy was torn down locally while this frame was in
    /// flight.
    pub(crate) fn from_proxy(&self, msg: &Message) {
        let Some(token) = msg.param_u64("proxy") else {
            debug!("from_proxy with no proxy token: {}", self.uuid);
            return;
        };
        let proxies = self.proxies.lock().unwrap();
        match proxies.get(&token) {
            Some(proxy) => {
                let _ = proxy.ops.send(ProxyOp::Data(msg.bulk.clone()));
            }
            None => debug!("frame for a no-longer existent proxy: {token}"),
        }
    }

    /// The broker closed one proxied connection.
    pub(crate) fn close_proxy(&self, token: u64) {
        match self.proxies.lock().unwrap().remove(&token) {
            Some(proxy) => {
                proxy.shut_down();
                debug!("closed proxy connection: {token}");
            }
            None => debug!("close for a proxy that is already gone: {token}"),
        }
    }

    /// Tear the tunnel down: all proxies, the listener, then tell the
    /// broker. Destroy-after-destroy is a no-op.
    pub(crate) fn internal_destroy(&self) {
        if !self.dead.mark_as_dead() {
            debug!("second attempt to destroy a tunnel (no biggie)");
            return;
        }
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let proxies: Vec<(u64, Proxy)> = self.proxies.lock().unwrap().drain().collect();
        for (_, proxy) in proxies {
            proxy.shut_down();
        }
        // May fail if the session died first, which is fine.
        let _ = self.conn.send_cmd(
            commands::DESTROY_TUNNEL,
            json!({ "tunnel": self.uuid }),
            Bytes::new(),
        );
        info!("destroyed tunnel: {}", self.uuid);
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("uuid", &self.uuid)
            .field("localport", &self.localport)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Drain broker-to-local bytes onto the socket.
async fn run_writer(mut write_half: OwnedWriteHalf, mut ops: mpsc::UnboundedReceiver<ProxyOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            ProxyOp::Data(bytes) => {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            ProxyOp::Shutdown => break,
        }
    }
    let _ = write_half.shutdown().await;
}

/// Forward local-to-broker bytes as `to_proxy` frames; on local close, send
/// `close_proxy` (once, and only if the broker didn't close first).
async fn run_reader(tunnel: Arc<Tunnel>, mut read_half: OwnedReadHalf, token: u64) {
    // The local client may connect (and send) before the broker has built
    // the remote end; hold its bytes back until the tunnel is up.
    match tunnel.ready.wait_until_ready(READY_TIMEOUT).await {
        Ok(true) => {}
        _ => {
            tunnel.close_proxy(token);
            return;
        }
    }

    let mut buf = vec![0u8; PROXY_READ_CAP];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                if let Some(proxy) = tunnel.proxies.lock().unwrap().remove(&token) {
                    let _ = proxy.ops.send(ProxyOp::Shutdown);
                    let _ = tunnel.conn.send_cmd(
                        commands::CLOSE_PROXY,
                        json!({ "tunnel": tunnel.uuid, "proxy": token }),
                        Bytes::new(),
                    );
                    debug!("local close for proxy: {token}");
                }
                return;
            }
            Ok(n) => {
                let sent = tunnel.conn.send_cmd(
                    commands::TO_PROXY,
                    json!({ "tunnel": tunnel.uuid, "proxy": token }),
                    Bytes::copy_from_slice(&buf[..n]),
                );
                if sent.is_err() {
                    return; // session is gone
                }
            }
        }
    }
}
