//! Content-addressed layer transfer.
//!
//! The broker is asked which of an image's layer hashes it is missing; only
//! those are extracted from the runtime's tar export and shipped as
//! fire-and-forget `upload` frames. Completion means the bytes were handed to
//! the transport, not that the broker persisted them.

use std::collections::HashSet;
use std::io::Read;

use berth_wire::commands;
use bytes::Bytes;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::connection::Connection;
use crate::image::{ImageRuntime, layer_stack};
use crate::{Error, Result};

pub(crate) async fn ensure_image_uploaded(
    conn: &Connection,
    runtime: &dyn ImageRuntime,
    image: &str,
) -> Result<()> {
    info!("ensuring layers are uploaded for: {image}");

    let descr = match runtime.describe(image).await {
        Ok(descr) => descr,
        Err(_) => {
            info!("image not held locally, pulling (may take some time): {image}");
            runtime.pull(image).await?;
            runtime.describe(image).await?
        }
    };

    // The unique hashes we can offer; the broker answers with the subset it
    // still needs.
    let offers = {
        let mut offers = layer_stack(&descr);
        offers.sort();
        offers.dedup();
        offers
    };
    let reply = conn
        .send_blocking(commands::UPLOAD_REQUIREMENTS, json!(offers), Bytes::new())
        .await?;
    let mut required: HashSet<String> = reply
        .params
        .as_array()
        .map(|needed| {
            needed
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    if required.is_empty() {
        info!("no layers need uploading for: {image}");
        return Ok(());
    }

    // The runtime can only export the whole image, so walk the archive and
    // pick out the layers that matter.
    info!("asking the runtime to export layers for: {image}");
    let tarball = runtime.export(image).await?;
    let mut archive = tar::Archive::new(std::io::Cursor::new(tarball));
    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        let is_layer = entry
            .path()
            .map_err(tar_error)?
            .to_string_lossy()
            .ends_with("/layer.tar");
        if !is_layer {
            continue;
        }

        let mut layer = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut layer).map_err(tar_error)?;
        let sha256 = hex_sha256(&layer);
        if required.remove(&sha256) {
            info!("background uploading: {sha256}");
            conn.send_cmd(commands::UPLOAD, json!({ "sha256": sha256 }), layer)?;
            if required.is_empty() {
                break;
            }
        }
    }

    if !required.is_empty() {
        return Err(Error::State(format!(
            "{} required layers were not present in the exported image",
            required.len()
        )));
    }
    Ok(())
}

fn tar_error(err: std::io::Error) -> Error {
    Error::Configuration(format!("unreadable image export: {err}"))
}

pub(crate) fn hex_sha256(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            hex_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
