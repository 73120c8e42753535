#![allow(dead_code, reason = "shared by multiple test binaries, each using a subset")]

//! A scripted in-process broker for end-to-end tests.
//!
//! Speaks the real wire contract over localhost TCP (responder role of
//! `berth_wire`), keeps an in-memory filesystem and layer store, and records
//! every client frame so tests can assert on exactly what went over the wire.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use berth::{ImageDescription, ImageRuntime, KeyPair};
use berth_wire::{Message, SecureTransport, commands};
use bytes::Bytes;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};

/// The FQDN tests pretend the broker lives at.
pub const FQDN: &str = "test.broker.local";
/// The private IP every spawned container reports.
pub const CONTAINER_IP: &str = "10.5.0.2";
/// A remote port the scripted broker answers with a canned HTTP 200.
pub const HTTP_PORT: u16 = 80;
/// A remote port the scripted broker plain-echoes proxy bytes on.
pub const ECHO_PORT: u16 = 7777;

const HTTP_200: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Length: 17\r\nConnection: close\r\n\r\nWelcome to nginx!";

pub struct BrokerState {
    pub seen: Mutex<Vec<Message>>,
    pub have_layers: Mutex<HashSet<String>>,
    pub files: Mutex<HashMap<String, Bytes>>,
    tunnels: Mutex<HashMap<String, u16>>,
    processes: Mutex<HashMap<String, Value>>,
    kickers: Mutex<HashMap<[u8; 32], mpsc::UnboundedSender<()>>>,
    pub sessions: AtomicUsize,
}

pub struct TestBroker {
    pub port: u16,
    pub public_b64: String,
    pub state: Arc<BrokerState>,
}

impl TestBroker {
    /// Frames received with the given command name, oldest first.
    pub fn frames(&self, command: &str) -> Vec<Message> {
        self.state
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.command == command)
            .cloned()
            .collect()
    }
}

pub async fn start_broker(have_layers: HashSet<String>, files: HashMap<String, Bytes>) -> TestBroker {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public_b64 = BASE64.encode(PublicKey::from(&secret).as_bytes());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let state = Arc::new(BrokerState {
        seen: Mutex::new(Vec::new()),
        have_layers: Mutex::new(have_layers),
        files: Mutex::new(files),
        tunnels: Mutex::new(HashMap::new()),
        processes: Mutex::new(HashMap::new()),
        kickers: Mutex::new(HashMap::new()),
        sessions: AtomicUsize::new(0),
    });

    let accept_state = state.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let secret = secret.clone();
            let state = accept_state.clone();
            tokio::spawn(async move {
                let _ = serve(stream, secret, state).await;
            });
        }
    });

    TestBroker {
        port,
        public_b64,
        state,
    }
}

async fn serve(
    stream: TcpStream,
    secret: StaticSecret,
    state: Arc<BrokerState>,
) -> Result<(), berth_wire::WireError> {
    let mut transport = SecureTransport::accept(stream, &secret).await?;
    state.sessions.fetch_add(1, Ordering::SeqCst);
    let identity = *transport.peer_public();

    // A second session under the same identity kicks the first.
    let (kick_tx, mut kick_rx) = mpsc::unbounded_channel();
    let previous = state.kickers.lock().unwrap().insert(identity, kick_tx);
    if let Some(previous) = previous {
        let _ = previous.send(());
    }

    transport
        .send(&Message::command(
            commands::RESOURCE_OFFER,
            json!({
                "nodes": [
                    {"pk-alpha": {"cpu": 400.0, "memory": 16.0}},
                    {"pk-beta": {"cpu": 900.0, "memory": 8.0}},
                ],
                "volumes": [
                    {"uuid": "volAAAAAAAAAAAAAAAAAAAAA", "tag": "pgdata"},
                ],
            }),
        ))
        .await?;

    loop {
        tokio::select! {
            _ = kick_rx.recv() => {
                transport.send(&Message::command(commands::KICKED, json!({}))).await?;
                return Ok(());
            }
            frame = transport.recv() => {
                let msg = frame?;
                state.seen.lock().unwrap().push(msg.clone());
                handle(&mut transport, &state, msg).await?;
            }
        }
    }
}

async fn handle(
    t: &mut SecureTransport<TcpStream>,
    state: &BrokerState,
    msg: Message,
) -> Result<(), berth_wire::WireError> {
    match msg.command.as_str() {
        commands::UPLOAD_REQUIREMENTS => {
            let reply = {
                let have = state.have_layers.lock().unwrap();
                let needed: Vec<&str> = msg
                    .params
                    .as_array()
                    .map(|offered| {
                        offered
                            .iter()
                            .filter_map(Value::as_str)
                            .filter(|hash| !have.contains(*hash))
                            .collect()
                    })
                    .unwrap_or_default();
                msg.reply(json!(needed), Bytes::new())
            };
            t.send(&reply).await?;
        }

        commands::UPLOAD => {
            let digest: String =
                Sha256::digest(&msg.bulk).iter().map(|b| format!("{b:02x}")).collect();
            assert_eq!(Some(digest.as_str()), msg.param_str("sha256"), "upload hash mismatch");
            state.have_layers.lock().unwrap().insert(digest);
        }

        commands::SPAWN_CONTAINER => {
            // A poison image id scripts a failed spawn.
            let id = msg.params["description"]["Id"].as_str().unwrap_or_default();
            let reply = if id == "sha256:boom" {
                msg.reply(json!({"exception": "no such image"}), Bytes::new())
            } else {
                msg.reply(json!({"status": "running", "ip": CONTAINER_IP}), Bytes::new())
            };
            t.send(&reply).await?;
        }

        commands::DESTROY_CONTAINER => {}

        commands::SPAWN_PROCESS => {
            let command = msg.params.get("command").cloned().unwrap_or(Value::Null);
            state.processes.lock().unwrap().insert(msg.id.clone(), command.clone());
            if command == json!(["echo", "Hello World"]) {
                t.send(&Message::new("", &msg.id, json!({}), "Hello World\n")).await?;
                t.send(&Message::new("", &msg.id, json!({}), Bytes::new())).await?;
                t.send(&Message::sentinel(&msg.id)).await?;
            }
            // Anything else stays interactive until stdin/destroy.
        }

        commands::STDIN_PROCESS => {
            let process = msg.param_str("process").unwrap_or_default().to_owned();
            let command = state.processes.lock().unwrap().get(&process).cloned();
            if let Some(command) = command {
                // Echo the injected bytes straight back as process output;
                // the "double" script sends them twice (tty-echo shape).
                t.send(&Message::new("", &process, json!({}), msg.bulk.clone())).await?;
                if command == json!(["double"]) {
                    t.send(&Message::new("", &process, json!({}), msg.bulk.clone())).await?;
                }
            }
        }

        commands::DESTROY_PROCESS => {
            let process = msg.param_str("process").unwrap_or_default().to_owned();
            if state.processes.lock().unwrap().remove(&process).is_some() {
                t.send(&Message::new("", &process, json!({}), Bytes::new())).await?;
                t.send(&Message::sentinel(&process)).await?;
            }
        }

        commands::FETCH => {
            let filename = msg.param_str("filename").unwrap_or_default();
            let found = state.files.lock().unwrap().get(filename).cloned();
            let reply = match found {
                Some(data) => msg.reply(json!({}), data),
                None => msg.reply(json!({"exception": format!("no such file: {filename}")}), Bytes::new()),
            };
            t.send(&reply).await?;
        }

        commands::PUT => {
            let filename = msg.param_str("filename").unwrap_or_default().to_owned();
            state.files.lock().unwrap().insert(filename, msg.bulk.clone());
            t.send(&msg.reply(json!({}), Bytes::new())).await?;
        }

        commands::FETCH_LOG => {
            let log = concat!(
                "{\"log\": \"server starting\", \"stream\": \"stdout\", \"time\": 1.5}\n",
                "{\"log\": \"ready\", \"stream\": \"stderr\", \"time\": 2.25}\n",
            );
            t.send(&msg.reply(json!({}), log.as_bytes().to_vec())).await?;
        }

        commands::ALLOW_CONNECTION | commands::DISALLOW_CONNECTION => {
            t.send(&msg.reply(json!({}), Bytes::new())).await?;
        }

        commands::CREATE_TUNNEL => {
            let tunnel = msg.param_str("tunnel").unwrap_or_default().to_owned();
            let port = msg.param_u64("port").unwrap_or_default() as u16;
            state.tunnels.lock().unwrap().insert(tunnel.clone(), port);
            t.send(&Message::new(commands::TUNNEL_UP, &tunnel, json!({}), Bytes::new())).await?;
        }

        commands::TO_PROXY => {
            let tunnel = msg.param_str("tunnel").unwrap_or_default().to_owned();
            let proxy = msg.param_u64("proxy").unwrap_or_default();
            let port = state.tunnels.lock().unwrap().get(&tunnel).copied();
            match port {
                Some(HTTP_PORT) => {
                    t.send(&Message::new(
                        commands::FROM_PROXY,
                        &tunnel,
                        json!({"proxy": proxy}),
                        HTTP_200,
                    ))
                    .await?;
                    t.send(&Message::new(
                        commands::CLOSE_PROXY,
                        &tunnel,
                        json!({"proxy": proxy}),
                        Bytes::new(),
                    ))
                    .await?;
                }
                Some(_) => {
                    t.send(&Message::new(
                        commands::FROM_PROXY,
                        &tunnel,
                        json!({"proxy": proxy}),
                        msg.bulk.clone(),
                    ))
                    .await?;
                }
                None => {}
            }
        }

        commands::CLOSE_PROXY => {}

        commands::DESTROY_TUNNEL => {
            let tunnel = msg.param_str("tunnel").unwrap_or_default();
            state.tunnels.lock().unwrap().remove(tunnel);
        }

        other => panic!("scripted broker got an unexpected command: {other}"),
    }
    Ok(())
}

/// Poll a condition until it holds (or give up loudly).
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

/// A config dir with fresh keys for [`FQDN`] and a `default_location` file.
pub fn client_config_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    KeyPair::generate().store(FQDN, dir.path()).unwrap();
    std::fs::write(dir.path().join("default_location"), format!("{FQDN}\n")).unwrap();
    dir
}

pub fn location_config(
    broker: &TestBroker,
    config_dir: &Path,
    runtime: Option<Box<dyn ImageRuntime>>,
) -> berth::LocationConfig {
    berth::LocationConfig {
        location: Some(FQDN.to_owned()),
        location_ip: Some("127.0.0.1".to_owned()),
        port: broker.port,
        config_dir: Some(config_dir.to_owned()),
        server_public: Some(broker.public_b64.clone()),
        runtime,
    }
}

/// An [`ImageRuntime`] serving one synthetic image from memory.
pub struct FakeRuntime {
    descr: ImageDescription,
    tarball: Vec<u8>,
    pulls: AtomicUsize,
    missing_until_pulled: bool,
}

#[async_trait::async_trait]
impl ImageRuntime for FakeRuntime {
    async fn describe(&self, image: &str) -> berth::Result<ImageDescription> {
        if self.missing_until_pulled && self.pulls.load(Ordering::SeqCst) == 0 {
            return Err(berth::Error::Configuration(format!(
                "local runtime does not have image: {image}"
            )));
        }
        Ok(self.descr.clone())
    }

    async fn export(&self, _image: &str) -> berth::Result<Vec<u8>> {
        Ok(self.tarball.clone())
    }

    async fn pull(&self, _image: &str) -> berth::Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Tests usually hold onto the runtime (for pull counts) while the location
/// owns a boxed handle, so this wraps a shared `Arc` of it for that case.
/// (The trait can't be implemented directly on `Arc<FakeRuntime>`: neither
/// `ImageRuntime` nor `Arc` is local to this crate, so the orphan rule
/// forbids it.)
pub struct SharedRuntime(pub Arc<FakeRuntime>);

#[async_trait::async_trait]
impl ImageRuntime for SharedRuntime {
    async fn describe(&self, image: &str) -> berth::Result<ImageDescription> {
        self.0.describe(image).await
    }

    async fn export(&self, image: &str) -> berth::Result<Vec<u8>> {
        self.0.export(image).await
    }

    async fn pull(&self, image: &str) -> berth::Result<()> {
        self.0.pull(image).await
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data).iter().map(|b| format!("{b:02x}")).collect()
}

/// Build a fake image: layer blobs become `<n>/layer.tar` entries in the
/// export and `sha256:<hash>` entries in the description's RootFS.
pub fn fake_image(id: &str, layers: &[&[u8]]) -> (FakeRuntime, Vec<String>) {
    let hashes: Vec<String> = layers.iter().map(|blob| sha256_hex(blob)).collect();

    let mut tar = tar::Builder::new(Vec::new());
    for (n, blob) in layers.iter().enumerate() {
        let mut header = tar::Header::new_gnu();
        header.set_size(blob.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, format!("{n}/layer.tar"), *blob).unwrap();
    }
    // Every docker export also carries a manifest; the uploader must skip it.
    let manifest = br#"[{"Config": "config.json"}]"#;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, "manifest.json", manifest.as_slice()).unwrap();
    let tarball = tar.into_inner().unwrap();

    let descr: ImageDescription = serde_json::from_value(json!({
        "Id": id,
        "Config": {"Entrypoint": ["/docker-entrypoint.sh"], "Cmd": ["nginx", "-g", "daemon off;"]},
        "ContainerConfig": {"Cmd": ["sh"]},
        "RootFS": {
            "Type": "layers",
            "Layers": hashes.iter().map(|h| format!("sha256:{h}")).collect::<Vec<_>>(),
        },
    }))
    .unwrap();

    (
        FakeRuntime {
            descr,
            tarball,
            pulls: AtomicUsize::new(0),
            missing_until_pulled: false,
        },
        hashes,
    )
}

impl FakeRuntime {
    /// Pretend the image is absent until `pull` has been called once.
    pub fn missing_until_pulled(mut self) -> Self {
        self.missing_until_pulled = true;
        self
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}
