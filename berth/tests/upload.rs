//! Layer-upload negotiation against the scripted broker.

mod support;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use berth::{Location, SpawnOptions};
use berth_wire::commands;
use serde_json::json;
use support::*;

#[tokio::test]
async fn uploads_only_the_layers_the_broker_lacks() {
    let (runtime, hashes) = fake_image("sha256:img1", &[b"layer-alpha", b"layer-beta"]);
    // The broker already holds the first layer.
    let broker = start_broker(HashSet::from([hashes[0].clone()]), HashMap::new()).await;
    let dir = client_config_dir();
    let location = Location::connect(location_config(&broker, dir.path(), Some(Box::new(runtime))))
        .await
        .unwrap();

    location.ensure_image_uploaded("img1").await.unwrap();

    // The negotiation offered every unique hash...
    let requirements = broker.frames(commands::UPLOAD_REQUIREMENTS);
    assert_eq!(requirements.len(), 1);
    let mut offered = hashes.clone();
    offered.sort();
    assert_eq!(requirements[0].params, json!(offered));

    // ...and only the missing layer was shipped, bytes intact.
    eventually(|| broker.frames(commands::UPLOAD).len() == 1).await;
    let upload = &broker.frames(commands::UPLOAD)[0];
    assert_eq!(upload.param_str("sha256"), Some(hashes[1].as_str()));
    assert_eq!(&upload.bulk[..], b"layer-beta");

    // The broker now has everything: a second run uploads nothing.
    location.ensure_image_uploaded("img1").await.unwrap();
    assert_eq!(broker.frames(commands::UPLOAD).len(), 1);
}

#[tokio::test]
async fn spawn_negotiates_before_spawning() {
    let (runtime, _) = fake_image("sha256:img2", &[b"only-layer"]);
    let broker = start_broker(HashSet::new(), HashMap::new()).await;
    let dir = client_config_dir();
    let location = Location::connect(location_config(&broker, dir.path(), Some(Box::new(runtime))))
        .await
        .unwrap();

    let node = location.best_node().await.unwrap();
    let container = node.spawn("img2", SpawnOptions::default()).await.unwrap();
    assert!(container.wait_until_ready().await.unwrap());

    let seen: Vec<String> = broker
        .state
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|msg| msg.command.clone())
        .filter(|cmd| cmd == commands::UPLOAD_REQUIREMENTS || cmd == commands::SPAWN_CONTAINER)
        .collect();
    assert_eq!(seen, [commands::UPLOAD_REQUIREMENTS, commands::SPAWN_CONTAINER]);
}

#[tokio::test]
async fn missing_image_is_pulled_once_then_described() {
    let (runtime, hashes) = fake_image("sha256:img3", &[b"pulled-layer"]);
    let runtime = Arc::new(runtime.missing_until_pulled());
    let broker = start_broker(HashSet::from_iter(hashes), HashMap::new()).await;
    let dir = client_config_dir();
    let location =
        Location::connect(location_config(
            &broker,
            dir.path(),
            Some(Box::new(SharedRuntime(runtime.clone()))),
        ))
            .await
            .unwrap();

    location.ensure_image_uploaded("img3").await.unwrap();
    assert_eq!(runtime.pull_count(), 1);
    assert!(broker.frames(commands::UPLOAD).is_empty());
}
