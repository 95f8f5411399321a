//! Kernel networking primitives.
//!
//! Everything the orchestration engine does to the kernel goes through the
//! [`Netlink`] trait. Two backends exist:
//!
//! - [`IpRoute2`] drives `ip(8)` and is what the daemon uses on a real host.
//! - [`DryRunNetlink`] keeps namespaces and links in memory and records every
//!   operation, for `--dry-run` and for tests.
//!
//! Namespaces are passed as `Option<&str>`; `None` is the root namespace.

mod dry_run;
mod iproute;

pub use dry_run::{DryRunNetlink, Operation};
pub use iproute::IpRoute2;

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;

/// Result type for netlink primitives.
pub type NetlinkResult<T> = std::result::Result<T, ResourceError>;

/// Kind of a kernel network device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    /// Layer 3 GRE tunnel.
    Gre,
    /// Layer 2 (Ethernet over) GRE tunnel.
    Gretap,
    /// One end of a veth pair.
    Veth,
    /// Linux bridge.
    Bridge,
    /// 802.1Q VLAN device.
    Vlan,
    /// tun device.
    Tun,
    /// tap device.
    Tap,
    /// Dummy device.
    Dummy,
    /// A device with no link kind, i.e. a physical interface.
    Physical,
    /// Any other kind reported by the kernel.
    Other(String),
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gre => write!(f, "gre"),
            Self::Gretap => write!(f, "gretap"),
            Self::Veth => write!(f, "veth"),
            Self::Bridge => write!(f, "bridge"),
            Self::Vlan => write!(f, "vlan"),
            Self::Tun => write!(f, "tun"),
            Self::Tap => write!(f, "tap"),
            Self::Dummy => write!(f, "dummy"),
            Self::Physical => write!(f, "physical"),
            Self::Other(kind) => write!(f, "{kind}"),
        }
    }
}

/// tun/tap device mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuntapMode {
    /// Layer 3 tun device.
    Tun,
    /// Layer 2 tap device.
    Tap,
}

impl fmt::Display for TuntapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tun => write!(f, "tun"),
            Self::Tap => write!(f, "tap"),
        }
    }
}

/// GRE tunnel parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreParams {
    /// Local endpoint.
    pub local: IpAddr,
    /// Remote endpoint.
    pub remote: IpAddr,
    /// Key expected on received packets.
    pub ikey: Option<u32>,
    /// Key set on sent packets.
    pub okey: Option<u32>,
    /// Outer packet TTL.
    pub ttl: u8,
    /// Create a GRETAP (layer 2) device instead of GRE.
    pub tap: bool,
}

/// Kind-specific creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkParams {
    /// GRE or GRETAP tunnel.
    Gre(GreParams),
    /// veth pair; both ends are created in the same namespace.
    Veth {
        /// Name of the peer end.
        peer: String,
    },
    /// Bridge.
    Bridge,
    /// VLAN on top of a parent device in the same namespace.
    Vlan {
        /// Parent device name.
        parent: String,
        /// VLAN ID.
        id: u16,
    },
    /// tun/tap device.
    Tuntap {
        /// tun or tap.
        mode: TuntapMode,
        /// Owning user.
        uid: Option<u32>,
        /// Owning group.
        gid: Option<u32>,
    },
    /// Dummy device.
    Dummy,
}

/// Request to create a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    /// Device name.
    pub name: String,
    /// Kind-specific parameters.
    pub params: LinkParams,
}

impl LinkSpec {
    /// A spec with the given name and parameters.
    #[must_use]
    pub fn new(name: impl Into<String>, params: LinkParams) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// The kind of device this spec creates.
    #[must_use]
    pub fn kind(&self) -> LinkKind {
        match &self.params {
            LinkParams::Gre(gre) if gre.tap => LinkKind::Gretap,
            LinkParams::Gre(_) => LinkKind::Gre,
            LinkParams::Veth { .. } => LinkKind::Veth,
            LinkParams::Bridge => LinkKind::Bridge,
            LinkParams::Vlan { .. } => LinkKind::Vlan,
            LinkParams::Tuntap {
                mode: TuntapMode::Tun,
                ..
            } => LinkKind::Tun,
            LinkParams::Tuntap {
                mode: TuntapMode::Tap,
                ..
            } => LinkKind::Tap,
            LinkParams::Dummy => LinkKind::Dummy,
        }
    }

    /// Whether an existing device of the same kind can stand in for this
    /// spec without being recreated.
    #[must_use]
    pub const fn is_reusable(&self) -> bool {
        matches!(self.params, LinkParams::Bridge | LinkParams::Dummy)
    }
}

/// A device as seen by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Device name.
    pub name: String,
    /// Namespace the device lives in (`None` for root).
    pub netns: Option<String>,
    /// Device kind.
    pub kind: LinkKind,
}

impl Link {
    /// Namespace as a borrowed option.
    #[must_use]
    pub fn netns(&self) -> Option<&str> {
        self.netns.as_deref()
    }
}

/// A child process spawned inside a namespace.
pub trait Process: Send {
    /// Wait for the process to exit and return its exit status.
    ///
    /// A process killed by a signal reports `-1`.
    fn wait(&mut self) -> NetlinkResult<i32>;

    /// Release the process, killing it if it is still running.
    fn release(&mut self);
}

/// Kernel networking primitives, scoped by namespace.
pub trait Netlink: Send + Sync + fmt::Debug {
    /// Create a device. Fails with `AlreadyExists` if the name is taken.
    fn create(&self, netns: Option<&str>, spec: &LinkSpec) -> NetlinkResult<Link>;

    /// Look up a device. Fails with `NotFound` if it does not exist.
    fn get(&self, netns: Option<&str>, name: &str) -> NetlinkResult<Link>;

    /// Delete a device. Deleting one end of a veth pair deletes both.
    fn remove(&self, link: &Link) -> NetlinkResult<()>;

    /// Add an address. Adding an address twice is not an error.
    fn add_ip(&self, link: &Link, address: IpAddr, prefix_len: u8) -> NetlinkResult<()>;

    /// Set the device administratively up.
    fn set_up(&self, link: &Link) -> NetlinkResult<()>;

    /// Move the device to another namespace, returning it as seen there.
    fn set_namespace(&self, link: &Link, netns: Option<&str>) -> NetlinkResult<Link>;

    /// Attach the device to a bridge in the same namespace.
    fn set_master(&self, link: &Link, bridge: &Link) -> NetlinkResult<()>;

    /// The bridge the device is attached to, if any.
    fn master(&self, link: &Link) -> NetlinkResult<Option<String>>;

    /// Flush pending changes in a namespace.
    fn commit(&self, netns: Option<&str>) -> NetlinkResult<()>;

    /// Create a named namespace. Creating an existing namespace is not an
    /// error.
    fn namespace_create(&self, name: &str) -> NetlinkResult<()>;

    /// Delete a named namespace and every device left in it.
    fn namespace_remove(&self, name: &str) -> NetlinkResult<()>;

    /// Names of all named namespaces.
    fn namespace_list(&self) -> NetlinkResult<BTreeSet<String>>;

    /// Spawn a command inside a namespace.
    fn popen(&self, netns: Option<&str>, argv: &[String]) -> NetlinkResult<Box<dyn Process>>;
}
