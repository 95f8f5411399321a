//! Interfaces an overlay is composed of.
//!
//! Each variant knows which kernel devices it needs and in which namespace
//! each of them lives. Variants are driven through [`InterfaceOps`]; the
//! [`Interface`] wrapper adds the lifecycle guard so that a variant never
//! sees a call out of order.

mod bridge;
mod dummy;
mod mesh_tunnel;
mod overlay_link;
mod tunnel;
mod tuntap;
mod veth;
mod vlan;

pub use bridge::Bridge;
pub use dummy::Dummy;
pub use mesh_tunnel::MeshTunnel;
pub use overlay_link::OverlayLink;
pub use tunnel::StaticTunnel;
pub use tuntap::Tuntap;
pub use veth::Veth;
pub use vlan::Vlan;

use std::sync::Arc;

use tracing::{debug, info};

use crate::allocator::Allocators;
use crate::config::InterfaceConfig;
use crate::error::{Result, StateError};
use crate::ipsec::MeshLinkRegistry;
use crate::netns::NamespaceHandle;
use crate::worker::{Worker, WorkerState};

/// Shared state an interface binds to during setup.
#[derive(Debug, Clone)]
pub struct SetupContext {
    /// Name of the owning overlay (and of its namespace).
    pub overlay: String,
    /// The daemon's allocators.
    pub allocators: Allocators,
    /// The daemon's mesh link registry.
    pub mesh_links: Arc<MeshLinkRegistry>,
}

impl SetupContext {
    /// Context for an overlay.
    #[must_use]
    pub fn new(
        overlay: impl Into<String>,
        allocators: Allocators,
        mesh_links: Arc<MeshLinkRegistry>,
    ) -> Self {
        Self {
            overlay: overlay.into(),
            allocators,
            mesh_links,
        }
    }

    /// Allocate a unique interface name.
    pub fn interface_name(&self, base: &str, suffix: Option<&str>, limit: usize) -> Result<String> {
        Ok(self
            .allocators
            .interface_names
            .allocate(base, suffix, limit)?)
    }
}

/// Namespace handles available while an overlay is starting or stopping.
#[derive(Debug, Clone, Copy)]
pub struct Env<'a> {
    /// The root namespace.
    pub root: &'a NamespaceHandle,
    /// The owning overlay's namespace.
    pub overlay: &'a NamespaceHandle,
}

/// Operations every interface variant provides.
pub trait InterfaceOps {
    /// Configured name.
    fn name(&self) -> &str;

    /// Whether the interface carries IPv6 addressing.
    fn is_ipv6(&self) -> bool;

    /// Allocate names and keys and bind to the daemon's shared state.
    fn setup(&mut self, ctx: &SetupContext) -> Result<()>;

    /// Create and configure the kernel devices.
    fn start(&mut self, env: &Env<'_>) -> Result<()>;

    /// Delete the kernel devices created by `start`.
    fn stop(&mut self, env: &Env<'_>) -> Result<()>;

    /// Release anything reserved by `setup`.
    fn remove(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Fetch a value bound during setup.
pub(crate) fn bound<'a, T>(value: Option<&'a T>, name: &str) -> Result<&'a T> {
    value.ok_or_else(|| StateError::NotSetup(format!("interface '{name}'")).into())
}

/// The closed set of interface variants.
#[derive(Debug)]
pub enum InterfaceVariant {
    /// GRE/GRETAP tunnel.
    StaticTunnel(StaticTunnel),
    /// Generated mesh tunnel.
    MeshTunnel(MeshTunnel),
    /// veth pair from another namespace.
    Veth(Veth),
    /// veth pair to another overlay.
    OverlayLink(OverlayLink),
    /// VLAN.
    Vlan(Vlan),
    /// tun/tap device.
    Tuntap(Tuntap),
    /// Dummy device.
    Dummy(Dummy),
}

impl InterfaceVariant {
    /// Human readable variant name.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::StaticTunnel(_) => "static tunnel",
            Self::MeshTunnel(_) => "mesh tunnel",
            Self::Veth(_) => "static veth",
            Self::OverlayLink(_) => "overlay link",
            Self::Vlan(_) => "static vlan",
            Self::Tuntap(_) => "static tuntap",
            Self::Dummy(_) => "static dummy",
        }
    }

    fn ops(&self) -> &dyn InterfaceOps {
        match self {
            Self::StaticTunnel(i) => i,
            Self::MeshTunnel(i) => i,
            Self::Veth(i) => i,
            Self::OverlayLink(i) => i,
            Self::Vlan(i) => i,
            Self::Tuntap(i) => i,
            Self::Dummy(i) => i,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn InterfaceOps {
        match self {
            Self::StaticTunnel(i) => i,
            Self::MeshTunnel(i) => i,
            Self::Veth(i) => i,
            Self::OverlayLink(i) => i,
            Self::Vlan(i) => i,
            Self::Tuntap(i) => i,
            Self::Dummy(i) => i,
        }
    }
}

impl From<InterfaceConfig> for InterfaceVariant {
    fn from(config: InterfaceConfig) -> Self {
        match config {
            InterfaceConfig::StaticTunnel(c) => Self::StaticTunnel(StaticTunnel::new(c)),
            InterfaceConfig::Veth(c) => Self::Veth(Veth::new(c)),
            InterfaceConfig::OverlayLink(c) => Self::OverlayLink(OverlayLink::new(c)),
            InterfaceConfig::Vlan(c) => Self::Vlan(Vlan::new(c)),
            InterfaceConfig::Tuntap(c) => Self::Tuntap(Tuntap::new(c)),
            InterfaceConfig::Dummy(c) => Self::Dummy(Dummy::new(c)),
        }
    }
}

/// An interface variant with its lifecycle state.
#[derive(Debug)]
pub struct Interface {
    variant: InterfaceVariant,
    worker: WorkerState,
}

impl Interface {
    /// Wrap a variant.
    #[must_use]
    pub fn new(variant: InterfaceVariant) -> Self {
        let description = format!("{} '{}'", variant.description(), variant.ops().name());
        Self {
            variant,
            worker: WorkerState::with_setup(description),
        }
    }

    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: InterfaceConfig) -> Self {
        Self::new(config.into())
    }

    /// The variant.
    #[must_use]
    pub const fn variant(&self) -> &InterfaceVariant {
        &self.variant
    }

    /// Configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.variant.ops().name()
    }

    /// Whether the interface carries IPv6 addressing.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.variant.ops().is_ipv6()
    }

    /// Bind to the daemon's shared state.
    pub fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        self.worker.check_setup()?;
        self.variant.ops_mut().setup(ctx)?;
        self.worker.finish_setup()?;
        Ok(())
    }

    /// Create the kernel devices.
    pub fn start(&mut self, env: &Env<'_>) -> Result<()> {
        self.worker.begin_start()?;
        info!(interface = %self.name(), "starting {}", self.variant.description());
        self.variant.ops_mut().start(env)?;
        self.worker.finish_start();
        info!(interface = %self.name(), "finished starting {}", self.variant.description());
        Ok(())
    }

    /// Delete the kernel devices.
    pub fn stop(&mut self, env: &Env<'_>) -> Result<()> {
        self.worker.begin_stop()?;
        info!(interface = %self.name(), "stopping {}", self.variant.description());
        self.variant.ops_mut().stop(env)?;
        self.worker.finish_stop();
        info!(interface = %self.name(), "finished stopping {}", self.variant.description());
        Ok(())
    }

    /// Delete devices a previous process may have left behind, then release
    /// reservations. The lifecycle state is left untouched.
    pub fn teardown(&mut self, env: &Env<'_>) -> Result<()> {
        if !self.worker.is_setup() {
            return Err(StateError::NotSetup(self.worker.description().to_string()).into());
        }
        debug!(interface = %self.name(), "tearing down stale {}", self.variant.description());
        self.variant.ops_mut().stop(env)?;
        self.variant.ops_mut().remove()
    }

    /// Release reservations.
    pub fn remove(&mut self) -> Result<()> {
        self.worker.begin_remove()?;
        self.variant.ops_mut().remove()?;
        self.worker.finish_remove();
        Ok(())
    }
}

impl Worker for Interface {
    fn worker(&self) -> &WorkerState {
        &self.worker
    }
}
