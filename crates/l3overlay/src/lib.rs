//! l3overlay - layer 3 overlay networks over Linux network namespaces.
//!
//! Each overlay is a network namespace with a set of interfaces composed
//! into it: GRE/GRETAP tunnels (static or generated as a full mesh), veth
//! pairs, VLANs, tun/tap and dummy devices. The [`Daemon`] orders overlays
//! by their cross references, allocates process-wide resources (tunnel keys
//! and bounded interface names) and drives everything through a strict
//! setup/start/stop/remove lifecycle.
//!
//! Kernel access goes through the [`netlink::Netlink`] trait. [`IpRoute2`]
//! applies changes with `ip(8)`; [`DryRunNetlink`] records them in memory.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use l3overlay::{Daemon, DaemonConfig, DryRunNetlink, NoIpsec};
//!
//! # fn main() -> l3overlay::Result<()> {
//! let config = DaemonConfig { dry_run: true, ..DaemonConfig::default() };
//! let overlays = l3overlay::config::load_overlays(&config.overlay_conf_dir)?;
//! let mut daemon = Daemon::new(config, overlays, Arc::new(DryRunNetlink::new()), Box::new(NoIpsec))?;
//! daemon.setup()?;
//! daemon.start()?;
//! daemon.stop()?;
//! daemon.remove()?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod config;
pub mod daemon;
pub mod error;
pub mod interface;
pub mod ipsec;
pub mod netlink;
pub mod netns;
pub mod overlay;
pub mod resolver;
pub mod worker;

pub use allocator::{Allocators, GreKeyAllocator, InterfaceNameAllocator};
pub use config::{DaemonConfig, InterfaceConfig, OverlayConfig};
pub use daemon::Daemon;
pub use error::{ConfigError, Error, ResourceError, Result, StateError};
pub use ipsec::{IpsecControl, MeshLink, MeshLinkRegistry, NoIpsec};
pub use netlink::{DryRunNetlink, IpRoute2, Netlink};
pub use overlay::Overlay;
pub use worker::{State, Worker};
