//! The authenticated duplex transport.
//!
//! A curve25519 handshake establishes mutually-authenticated directional
//! keys, after which every [`Message`] travels as one ChaCha20-Poly1305
//! record inside a length-delimited frame. Both the initiating (client) and
//! responding (broker/test-harness) roles live here so the two ends share
//! one implementation of the record layer.
//!
//! Handshake:
//!
//! ```text
//! client -> server : e_c (32 bytes) || s_c (32 bytes)
//! server -> client : e_s (32 bytes)
//! keys = SHA-512( dh(e_c,e_s) || dh(s_c,e_s) || dh(e_c,s_s) )
//! ```
//!
//! The client proves possession of its static key through `dh(s_c,e_s)`; the
//! server proves its published identity through `dh(e_c,s_s)`. A peer without
//! the right static secret derives different keys and its first record fails
//! authentication.

use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;
use x25519_dalek::{PublicKey, ReusableSecret, SharedSecret, StaticSecret};

use crate::{Message, WireError};

/// Upper bound on one record: a single image layer travels as one bulk.
const MAX_RECORD: usize = 1 << 30;

/// Which end of the handshake this transport played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

fn record_framing<S: AsyncRead + AsyncWrite>(stream: S) -> Framed<S, LengthDelimitedCodec> {
    Framed::new(
        stream,
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_RECORD)
            .new_codec(),
    )
}

/// One direction of the record layer: an AEAD key plus a counter nonce.
struct RecordCipher {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl RecordCipher {
    fn new(key: &[u8]) -> Self {
        RecordCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Nonce::from(nonce)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = self.next_nonce();
        self.cipher.encrypt(&nonce, plaintext).map_err(|_| WireError::Crypto)
    }

    fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = self.next_nonce();
        self.cipher.decrypt(&nonce, record).map_err(|_| WireError::Crypto)
    }
}

/// An authenticated message pipe over any duplex byte stream.
pub struct SecureTransport<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    tx: RecordCipher,
    rx: RecordCipher,
    peer_public: [u8; 32],
    role: HandshakeRole,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureTransport<S> {
    /// Client side: authenticate to a broker whose static public key is
    /// already known (DNS TXT or explicit override).
    pub async fn connect(
        stream: S,
        identity: &StaticSecret,
        server_public: &PublicKey,
    ) -> Result<Self, WireError> {
        let mut framed = record_framing(stream);
        let eph = ReusableSecret::random_from_rng(OsRng);

        let mut hello = BytesMut::with_capacity(64);
        hello.extend_from_slice(PublicKey::from(&eph).as_bytes());
        hello.extend_from_slice(PublicKey::from(identity).as_bytes());
        framed.send(hello.freeze()).await?;

        let frame = framed.next().await.ok_or(WireError::Closed)??;
        let server_eph = parse_public(&frame)?;

        let keys = derive_keys(
            eph.diffie_hellman(&server_eph),
            identity.diffie_hellman(&server_eph),
            eph.diffie_hellman(server_public),
        )?;
        debug!("transport authenticated as initiator");
        Ok(SecureTransport {
            framed,
            tx: RecordCipher::new(&keys[..32]),
            rx: RecordCipher::new(&keys[32..]),
            peer_public: server_public.to_bytes(),
            role: HandshakeRole::Initiator,
        })
    }

    /// Responder side: accept any client and learn its identity from the
    /// handshake. Used by the broker and by in-process test harnesses.
    pub async fn accept(stream: S, identity: &StaticSecret) -> Result<Self, WireError> {
        let mut framed = record_framing(stream);

        let frame = framed.next().await.ok_or(WireError::Closed)??;
        if frame.len() != 64 {
            return Err(WireError::Handshake("client hello must be 64 bytes"));
        }
        let client_eph = parse_public(&frame[..32])?;
        let client_static = parse_public(&frame[32..])?;

        let eph = ReusableSecret::random_from_rng(OsRng);
        framed
            .send(Bytes::copy_from_slice(PublicKey::from(&eph).as_bytes()))
            .await?;

        let keys = derive_keys(
            eph.diffie_hellman(&client_eph),
            eph.diffie_hellman(&client_static),
            identity.diffie_hellman(&client_eph),
        )?;
        debug!("transport accepted a client");
        Ok(SecureTransport {
            framed,
            // Directional keys are named from the client's point of view.
            tx: RecordCipher::new(&keys[32..]),
            rx: RecordCipher::new(&keys[..32]),
            peer_public: client_static.to_bytes(),
            role: HandshakeRole::Responder,
        })
    }

    /// The static public key the peer authenticated as. For the responder
    /// this is the session identity used to detect duplicate logins.
    pub fn peer_public(&self) -> &[u8; 32] {
        &self.peer_public
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), WireError> {
        let record = self.tx.seal(&msg.encode())?;
        self.framed.send(Bytes::from(record)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message, WireError> {
        let frame = self.framed.next().await.ok_or(WireError::Closed)??;
        let plaintext = self.rx.open(&frame)?;
        Message::decode(&plaintext)
    }
}

fn parse_public(bytes: &[u8]) -> Result<PublicKey, WireError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| WireError::Handshake("public key must be 32 bytes"))?;
    Ok(PublicKey::from(raw))
}

fn derive_keys(
    ee: SharedSecret,
    se: SharedSecret,
    es: SharedSecret,
) -> Result<[u8; 64], WireError> {
    if !(ee.was_contributory() && se.was_contributory() && es.was_contributory()) {
        return Err(WireError::Handshake("low-order public key"));
    }
    let mut hasher = Sha512::new();
    hasher.update(ee.as_bytes());
    hasher.update(se.as_bytes());
    hasher.update(es.as_bytes());
    Ok(hasher.finalize().into())
}
