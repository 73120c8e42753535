//! Long-term curve25519 identity, stored as base64 text under the config
//! directory: `<dir>/<fqdn>.pub` and `<dir>/<fqdn>` (secret). The same
//! directory holds `default_location`, a single line naming the broker to
//! use when none is given.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

/// Name of the file holding the default broker FQDN.
const DEFAULT_LOCATION_FILE: &str = "default_location";

/// The config directory, `~/.berth` unless overridden.
pub fn default_config_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".berth"))
        .ok_or_else(|| Error::Configuration("cannot determine a home directory".into()))
}

/// Read the default broker FQDN from `<dir>/default_location`.
pub fn default_location(dir: &Path) -> Result<String> {
    let path = dir.join(DEFAULT_LOCATION_FILE);
    let text = std::fs::read_to_string(&path).map_err(|_| {
        Error::Configuration(format!(
            "no {} so cannot choose a default location; \
             write the broker fqdn there or pass one explicitly",
            path.display()
        ))
    })?;
    let fqdn = text.trim();
    if fqdn.is_empty() {
        return Err(Error::Configuration(format!("{} is empty", path.display())));
    }
    Ok(fqdn.to_owned())
}

/// A public/secret curve25519 pair, immutable after load. The public half is
/// the session identity.
#[derive(Clone)]
pub struct KeyPair {
    public: String,
    secret: Option<String>,
}

impl KeyPair {
    /// Load the keys named after a location. The public half must exist; the
    /// secret half may be absent (a public-only pair cannot connect).
    pub fn load(location: &str, dir: &Path) -> Result<KeyPair> {
        let public = std::fs::read_to_string(dir.join(format!("{location}.pub")))
            .map_err(|_| {
                Error::Configuration(format!(
                    "no public key for {location} under {}",
                    dir.display()
                ))
            })?
            .trim()
            .to_owned();
        let secret = std::fs::read_to_string(dir.join(location))
            .ok()
            .map(|text| text.trim().to_owned());
        let pair = KeyPair { public, secret };
        pair.public_binary()?; // fail early on corrupt key text
        Ok(pair)
    }

    /// A fresh random pair.
    pub fn generate() -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyPair {
            public: BASE64.encode(public.as_bytes()),
            secret: Some(BASE64.encode(secret.as_bytes())),
        }
    }

    /// Write both halves next to each other, named after `location`.
    pub fn store(&self, location: &str, dir: &Path) -> Result<()> {
        let io = |e: std::io::Error| Error::Configuration(format!("cannot write keys: {e}"));
        std::fs::create_dir_all(dir).map_err(io)?;
        std::fs::write(dir.join(format!("{location}.pub")), format!("{}\n", self.public))
            .map_err(io)?;
        if let Some(secret) = &self.secret {
            std::fs::write(dir.join(location), format!("{secret}\n")).map_err(io)?;
        }
        Ok(())
    }

    /// The identity as base64 text, as it travels in params.
    pub fn public(&self) -> &str {
        &self.public
    }

    pub fn public_binary(&self) -> Result<[u8; 32]> {
        decode_key(&self.public)
    }

    pub fn secret_binary(&self) -> Result<[u8; 32]> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| Error::Configuration("no secret key loaded".into()))?;
        decode_key(secret)
    }

    pub(crate) fn static_secret(&self) -> Result<StaticSecret> {
        Ok(StaticSecret::from(self.secret_binary()?))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Decode 32 raw key bytes from base64 text (also used for the DNS TXT
/// record carrying the broker's public key).
pub(crate) fn decode_key(text: &str) -> Result<[u8; 32]> {
    let raw = BASE64
        .decode(text.trim())
        .map_err(|_| Error::Configuration(format!("key text is not base64: {text}")))?;
    raw.try_into()
        .map_err(|_| Error::Configuration("key is not 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pair = KeyPair::generate();
        pair.store("broker.example.com", dir.path()).unwrap();

        let loaded = KeyPair::load("broker.example.com", dir.path()).unwrap();
        assert_eq!(loaded.public(), pair.public());
        assert_eq!(loaded.secret_binary().unwrap(), pair.secret_binary().unwrap());
    }

    #[test]
    fn missing_public_key_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            KeyPair::load("broker.example.com", dir.path()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn secret_half_is_optional_until_used() {
        let dir = tempfile::tempdir().unwrap();
        let pair = KeyPair::generate();
        pair.store("b.example.com", dir.path()).unwrap();
        std::fs::remove_file(dir.path().join("b.example.com")).unwrap();

        let loaded = KeyPair::load("b.example.com", dir.path()).unwrap();
        assert_eq!(loaded.public(), pair.public());
        assert!(loaded.secret_binary().is_err());
    }

    #[test]
    fn default_location_wants_the_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(default_location(dir.path()), Err(Error::Configuration(_))));

        std::fs::write(dir.path().join("default_location"), "broker.example.com\n").unwrap();
        assert_eq!(default_location(dir.path()).unwrap(), "broker.example.com");
    }
}
