//! The local container runtime, as seen by the SDK.
//!
//! The runtime is an opaque collaborator: it can describe an image, export it
//! as a tar archive, and pull it from a registry. [`DockerCli`] drives the
//! `docker` binary; tests substitute their own implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{Error, Result};

#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Image metadata as the runtime reports it (`docker image inspect`).
    /// Fails when the runtime does not have the image locally.
    async fn describe(&self, image: &str) -> Result<ImageDescription>;

    /// The whole image as one tar archive (`docker save`), held in memory.
    async fn export(&self, image: &str) -> Result<Vec<u8>>;

    /// Fetch the image from a registry (`docker pull`).
    async fn pull(&self, image: &str) -> Result<()>;
}

/// The slice of image metadata the broker needs to boot a container. Fields
/// we do not interpret ride along in `extra` untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageDescription {
    #[serde(rename = "Id", default)]
    pub id: String,
    #[serde(rename = "Config", default)]
    pub config: Value,
    #[serde(rename = "RootFS")]
    pub root_fs: RootFs,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "Type", default)]
    pub fs_type: String,
    #[serde(rename = "Layers", default)]
    pub layers: Vec<String>,
}

impl ImageDescription {
    /// The build-time config duplicates `Config` and the broker has no use
    /// for it.
    pub(crate) fn strip_container_config(&mut self) {
        self.extra.remove("ContainerConfig");
    }

    /// Replace the boot command so the container just idles.
    pub(crate) fn sleep_override(&mut self) {
        if !self.config.is_object() {
            self.config = json!({});
        }
        self.config["Entrypoint"] = Value::Null;
        self.config["Cmd"] = json!(["sleep", "inf"]);
    }
}

/// The ordered stack of layer content hashes needed to assemble an image,
/// with the `sha256:` prefixes stripped and consecutive duplicates collapsed
/// (an image may legitimately list the same layer twice in a row).
pub(crate) fn layer_stack(descr: &ImageDescription) -> Vec<String> {
    let mut stack: Vec<String> = Vec::with_capacity(descr.root_fs.layers.len());
    for layer in &descr.root_fs.layers {
        let hash = layer.strip_prefix("sha256:").unwrap_or(layer);
        if stack.last().map(String::as_str) == Some(hash) {
            continue;
        }
        stack.push(hash.to_owned());
    }
    stack
}

/// Drives a local `docker` binary.
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        DockerCli::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        DockerCli {
            binary: "docker".to_owned(),
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        DockerCli {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ImageRuntime for DockerCli {
    async fn describe(&self, image: &str) -> Result<ImageDescription> {
        let output = async_process::Command::new(&self.binary)
            .args(["image", "inspect", image])
            .output()
            .await
            .map_err(|err| Error::Configuration(format!("cannot run {}: {err}", self.binary)))?;
        if !output.status.success() {
            return Err(Error::Configuration(format!(
                "local runtime does not have image: {image}"
            )));
        }
        // `docker image inspect` prints an array even for a single image.
        let mut described: Vec<ImageDescription> = serde_json::from_slice(&output.stdout)
            .map_err(|err| Error::Configuration(format!("unparseable image description: {err}")))?;
        described
            .drain(..)
            .next()
            .ok_or_else(|| Error::Configuration(format!("empty image description for: {image}")))
    }

    async fn export(&self, image: &str) -> Result<Vec<u8>> {
        let output = async_process::Command::new(&self.binary)
            .args(["save", image])
            .output()
            .await
            .map_err(|err| Error::Configuration(format!("cannot run {}: {err}", self.binary)))?;
        if !output.status.success() {
            return Err(Error::Configuration(format!("runtime cannot export image: {image}")));
        }
        Ok(output.stdout)
    }

    async fn pull(&self, image: &str) -> Result<()> {
        let status = async_process::Command::new(&self.binary)
            .args(["pull", image])
            .status()
            .await
            .map_err(|err| Error::Configuration(format!("cannot run {}: {err}", self.binary)))?;
        if !status.success() {
            return Err(Error::Configuration(format!("could not pull image: {image}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descr(layers: &[&str]) -> ImageDescription {
        serde_json::from_value(json!({
            "Id": "sha256:feedface",
            "Config": {"Entrypoint": ["/docker-entrypoint.sh"], "Cmd": ["nginx"]},
            "ContainerConfig": {"Cmd": ["sh"]},
            "RootFS": {"Type": "layers", "Layers": layers},
        }))
        .unwrap()
    }

    #[test]
    fn layer_stack_strips_and_collapses() {
        let d = descr(&["sha256:aaa", "sha256:bbb", "sha256:bbb", "sha256:aaa"]);
        // Only *consecutive* duplicates collapse.
        assert_eq!(layer_stack(&d), vec!["aaa", "bbb", "aaa"]);
    }

    #[test]
    fn sleep_override_replaces_the_boot_command() {
        let mut d = descr(&["sha256:aaa"]);
        d.sleep_override();
        assert_eq!(d.config["Entrypoint"], Value::Null);
        assert_eq!(d.config["Cmd"], json!(["sleep", "inf"]));
    }

    #[test]
    fn container_config_is_stripped_and_extra_survives() {
        let mut d = descr(&["sha256:aaa"]);
        d.strip_container_config();
        let round = serde_json::to_value(&d).unwrap();
        assert!(round.get("ContainerConfig").is_none());
        assert_eq!(round["RootFS"]["Layers"], json!(["sha256:aaa"]));
    }
}
