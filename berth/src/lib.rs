//! Client SDK for berth container hosting.
//!
//! A [`Location`] is a long-lived authenticated session with a broker that
//! fronts one or more worker [`Node`]s. Through it you upload image layers,
//! spawn [`Container`]s, attach streaming [`Process`]es, move files, open
//! local TCP [`Tunnel`]s onto container ports, and manage the firewall
//! between containers. One secure transport carries every conversation; a
//! single background reactor task multiplexes the replies.
//!
//! ```no_run
//! use berth::{Location, LocationConfig, SpawnOptions};
//!
//! # async fn demo() -> berth::Result<()> {
//! let location = Location::connect(LocationConfig::default()).await?;
//! let node = location.best_node().await?;
//! let container = node.spawn("nginx", SpawnOptions::default()).await?;
//! container.wait_until_ready().await?;
//! let index = container.fetch("/usr/share/nginx/html/index.html").await?;
//! println!("{}", String::from_utf8_lossy(&index));
//! # Ok(())
//! # }
//! ```

mod collection;
mod connection;
mod container;
mod error;
mod ids;
mod image;
mod keys;
mod lifecycle;
mod location;
mod node;
mod process;
mod reactor;
mod tunnel;
mod upload;

pub use collection::{TaggedCollection, Taggable, valid_tag};
pub use connection::{BROKER_PORT, Connection};
pub use container::{Container, LogEntry};
pub use error::{Error, Result};
pub use image::{DockerCli, ImageDescription, ImageRuntime, RootFs};
pub use keys::{KeyPair, default_config_dir, default_location};
pub use lifecycle::{DeadFlag, IMAGE_READY_TIMEOUT, Latch, READY_TIMEOUT};
pub use location::{Location, LocationConfig, RankBias, Volume};
pub use node::{Node, NodeStats, SpawnOptions};
pub use process::{DataCallback, Process, TerminationCallback};
pub use tunnel::Tunnel;
