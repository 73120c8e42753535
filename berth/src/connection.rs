//! The authenticated session transport and its three send modes.
//!
//! A [`Connection`] is a pair of channels into the reactor task that owns the
//! trunk socket (see [`crate::reactor`]): callers on any task enqueue frames
//! and reply registrations; only the reactor touches the wire. Commands are
//! registered on the [`ConnectionBuilder`] before the reactor starts, which
//! is what makes mid-flight dispatch-table mutation unrepresentable.
//!
//! Send modes:
//! - [`Connection::send_cmd`] — fire and forget.
//! - [`Connection::send_streaming`] — registers a frame callback under a
//!   fresh correlation id; the callback runs on the reactor task for every
//!   frame until the `no_more_replies` sentinel unregisters it.
//! - [`Connection::send_blocking`] — parks the caller on a oneshot until the
//!   reply arrives; a remote `exception` raises instead. Handlers cannot call
//!   it (they are synchronous closures), which rules out the self-deadlock by
//!   construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use berth_wire::{Message, SecureTransport};
use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::keys::{KeyPair, decode_key};
use crate::lifecycle::DeadFlag;
use crate::reactor::{CommandHandler, Control, FrameFn, Reactor, ReplySink};
use crate::{Error, Result, ids};

/// The one TCP port a broker listens on.
pub const BROKER_PORT: u16 = 5555;

/// Fetch the broker's public key from the TXT record at its FQDN.
pub(crate) async fn server_key_from_dns(fqdn: &str) -> Result<[u8; 32]> {
    let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|err| Error::Configuration(format!("cannot build a dns resolver: {err}")))?;
    let name = format!("{fqdn}.");
    let lookup = resolver
        .txt_lookup(name.as_str())
        .await
        .map_err(|_| Error::Configuration(format!("no dns txt record, is the location valid? {fqdn}")))?;
    let record = lookup
        .iter()
        .next()
        .ok_or_else(|| Error::Configuration(format!("empty dns txt record for {fqdn}")))?;
    let text: String = record
        .txt_data()
        .iter()
        .map(|part| String::from_utf8_lossy(part))
        .collect();
    decode_key(&text).map_err(|_| Error::Configuration(format!("the dns txt record for {fqdn} is broken")))
}

/// Handle onto a live session transport. Cheap to share (`Arc`), usable from
/// any task.
pub struct Connection {
    location: String,
    public: String,
    outbound: mpsc::UnboundedSender<Message>,
    control: mpsc::UnboundedSender<Control>,
    dead: DeadFlag,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// The broker FQDN this session is connected to.
    pub fn location_name(&self) -> &str {
        &self.location
    }

    /// Our session identity (public key, base64 text).
    pub fn pk(&self) -> &str {
        &self.public
    }

    /// Fire and forget.
    pub(crate) fn send_cmd(&self, cmd: &str, params: Value, bulk: impl Into<Bytes>) -> Result<()> {
        self.send_with_id(cmd, "", params, bulk)
    }

    /// Fire and forget under a caller-chosen correlation id (tunnels use
    /// their own uuid so broker-initiated frames can be routed back).
    pub(crate) fn send_with_id(
        &self,
        cmd: &str,
        id: &str,
        params: Value,
        bulk: impl Into<Bytes>,
    ) -> Result<()> {
        self.dead.ensure_alive("connection")?;
        self.outbound
            .send(Message::new(cmd, id, params, bulk.into()))
            .map_err(|_| Error::Disconnected)
    }

    /// Route every frame carrying `id` to `handler` until the sentinel.
    /// The registration is queued ahead of any send, so the reply cannot
    /// outrun it.
    pub(crate) fn register_stream(&self, id: &str, handler: FrameFn) -> Result<()> {
        self.dead.ensure_alive("connection")?;
        self.control
            .send(Control::Register {
                id: id.to_owned(),
                sink: ReplySink::Stream(handler),
            })
            .map_err(|_| Error::Disconnected)
    }

    pub(crate) fn unregister_reply(&self, id: &str) {
        let _ = self.control.send(Control::Unregister { id: id.to_owned() });
    }

    /// Send a command whose replies stream back into `handler`. Returns the
    /// fresh correlation id identifying the conversation.
    pub(crate) fn send_streaming(
        &self,
        cmd: &str,
        params: Value,
        bulk: impl Into<Bytes>,
        handler: FrameFn,
    ) -> Result<String> {
        let id = ids::new_id();
        self.register_stream(&id, handler)?;
        self.send_with_id(cmd, &id, params, bulk)?;
        Ok(id)
    }

    /// Send a command and park until its reply arrives. A reply carrying an
    /// `exception` param raises it here; reactor shutdown fails the call
    /// with [`Error::Disconnected`] instead of hanging.
    pub(crate) async fn send_blocking(
        &self,
        cmd: &str,
        params: Value,
        bulk: impl Into<Bytes>,
    ) -> Result<Message> {
        self.dead.ensure_alive("connection")?;
        let id = ids::new_id();
        let (tx, rx) = oneshot::channel();
        self.control
            .send(Control::Register {
                id: id.clone(),
                sink: ReplySink::Once(tx),
            })
            .map_err(|_| Error::Disconnected)?;
        self.send_with_id(cmd, &id, params, bulk)?;

        let reply = rx.await.map_err(|_| Error::Disconnected)?;
        if let Some(exception) = reply.exception() {
            return Err(Error::Remote(exception.to_owned()));
        }
        Ok(reply)
    }

    /// Ask the reactor to stop at its next iteration (callable from command
    /// handlers).
    pub(crate) fn request_stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Stop the reactor; with `wait` the call returns only once the loop has
    /// acknowledged termination.
    pub async fn stop(&self, wait: bool) {
        self.request_stop();
        if wait {
            let task = self.task.lock().unwrap().take();
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }
}

/// Staging area between opening the transport and starting the reactor:
/// the only place command handlers can be registered.
pub(crate) struct ConnectionBuilder {
    conn: Arc<Connection>,
    transport: SecureTransport<TcpStream>,
    commands: HashMap<&'static str, CommandHandler>,
    on_shutdown: Option<Box<dyn FnOnce() + Send>>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl ConnectionBuilder {
    /// Dial the broker and authenticate. `connect_addr` is normally the
    /// FQDN itself but may be an explicit (local) address override.
    pub(crate) async fn open(
        location: &str,
        connect_addr: &str,
        port: u16,
        keys: &KeyPair,
        server_public: [u8; 32],
    ) -> Result<ConnectionBuilder> {
        info!("connecting to: {location}");
        let stream = TcpStream::connect((connect_addr, port))
            .await
            .map_err(|err| Error::Transport(format!("cannot reach {connect_addr}:{port}: {err}")))?;
        stream.set_nodelay(true).ok();
        let transport = SecureTransport::connect(
            stream,
            &keys.static_secret()?,
            &x25519_dalek::PublicKey::from(server_public),
        )
        .await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(ConnectionBuilder {
            conn: Arc::new(Connection {
                location: location.to_owned(),
                public: keys.public().to_owned(),
                outbound: outbound_tx,
                control: control_tx,
                dead: DeadFlag::new(),
                task: Mutex::new(None),
            }),
            transport,
            commands: HashMap::new(),
            on_shutdown: None,
            outbound_rx,
            control_rx,
        })
    }

    /// The connection handle; sends enqueue until the reactor starts.
    pub(crate) fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Declare one entry of the command table. Panics on a duplicate name,
    /// which is a wiring bug.
    pub(crate) fn register_command(
        &mut self,
        name: &'static str,
        required: &'static [&'static str],
        needs_reply: bool,
        handler: FrameFn,
    ) {
        let clash = self.commands.insert(
            name,
            CommandHandler {
                handler,
                required,
                needs_reply,
            },
        );
        assert!(clash.is_none(), "command registered twice: {name}");
        debug!("message loop will handle: {name}");
    }

    pub(crate) fn on_shutdown(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.on_shutdown = Some(Box::new(callback));
    }

    /// Consume the builder and start the event loop. No further command
    /// registration is possible past this point.
    pub(crate) fn start(self) -> Arc<Connection> {
        let conn = self.conn;
        let shutdown_conn = conn.clone();
        let user_shutdown = self.on_shutdown;
        let reactor = Reactor {
            transport: self.transport,
            outbound: self.outbound_rx,
            control: self.control_rx,
            commands: self.commands,
            replies: HashMap::new(),
            on_dispatch_error: None,
            on_shutdown: Some(Box::new(move || {
                shutdown_conn.dead.mark_as_dead();
                if let Some(callback) = user_shutdown {
                    callback();
                }
            })),
        };
        let task = tokio::spawn(reactor.run());
        *conn.task.lock().unwrap() = Some(task);
        conn
    }
}
