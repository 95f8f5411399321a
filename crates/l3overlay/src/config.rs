//! Daemon and overlay configuration.
//!
//! The daemon reads one global file (`l3overlay.toml`) and one file per
//! overlay from `overlay_conf_dir`. Every file is validated on load; an
//! overlay that loads is guaranteed to be internally consistent, although
//! references to other overlays are only checked when the daemon resolves
//! its dependency order.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::netlink::TuntapMode;

/// Default runtime state directory.
pub const DEFAULT_LIB_DIR: &str = "/var/lib/l3overlay";

/// Default overlay configuration directory.
pub const DEFAULT_OVERLAY_CONF_DIR: &str = "/etc/l3overlay/overlays";

fn default_true() -> bool {
    true
}

fn default_lib_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LIB_DIR)
}

fn default_overlay_conf_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OVERLAY_CONF_DIR)
}

/// Global daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Record kernel operations in memory instead of applying them.
    #[serde(default)]
    pub dry_run: bool,
    /// Runtime state directory.
    #[serde(default = "default_lib_dir")]
    pub lib_dir: PathBuf,
    /// Directory holding one configuration file per overlay.
    #[serde(default = "default_overlay_conf_dir")]
    pub overlay_conf_dir: PathBuf,
    /// Base directory for relative firewall script paths.
    #[serde(default)]
    pub fwbuilder_script_dir: Option<PathBuf>,
    /// Whether mesh links are protected with IPsec.
    #[serde(default)]
    pub use_ipsec: bool,
    /// Whether the IPsec daemon is owned (started and stopped) by us.
    #[serde(default)]
    pub ipsec_manage: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            lib_dir: default_lib_dir(),
            overlay_conf_dir: default_overlay_conf_dir(),
            fwbuilder_script_dir: None,
            use_ipsec: false,
            ipsec_manage: false,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Invalid(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lib_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("lib_dir cannot be empty".to_string()));
        }
        if self.ipsec_manage && !self.use_ipsec {
            return Err(ConfigError::Invalid(
                "ipsec_manage requires use_ipsec".to_string(),
            ));
        }
        Ok(())
    }

    /// Runtime directory of one overlay.
    #[must_use]
    pub fn overlay_dir(&self, name: &str) -> PathBuf {
        self.lib_dir.join("overlays").join(name)
    }

    /// Resolve a firewall script path against `fwbuilder_script_dir`.
    #[must_use]
    pub fn resolve_script(&self, script: &Path) -> PathBuf {
        match &self.fwbuilder_script_dir {
            Some(dir) if script.is_relative() => dir.join(script),
            _ => script.to_path_buf(),
        }
    }
}

/// A node in a mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshNode {
    /// Node name.
    pub name: String,
    /// Physical address of the node.
    pub address: IpAddr,
}

/// Full-mesh tunnel settings for an overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshConfig {
    /// Autonomous system number of the overlay.
    pub asn: u32,
    /// Pool the point-to-point linknet addresses are taken from.
    pub linknet_pool: IpNet,
    /// Name of this node in `nodes`.
    pub this_node: String,
    /// Every node participating in the mesh, in a fixed order.
    pub nodes: Vec<MeshNode>,
}

/// GRE tunnel flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Layer 3.
    #[default]
    Gre,
    /// Layer 2.
    Gretap,
}

/// A statically configured GRE/GRETAP tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticTunnelConfig {
    /// Interface name.
    pub name: String,
    /// Tunnel flavour.
    #[serde(default)]
    pub mode: TunnelMode,
    /// Local endpoint.
    pub local: IpAddr,
    /// Remote endpoint.
    pub remote: IpAddr,
    /// Address assigned to the tunnel device.
    pub address: IpAddr,
    /// Prefix length of `address`.
    pub netmask: u8,
    /// Key used in both directions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<u32>,
    /// Key expected on received packets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ikey: Option<u32>,
    /// Key set on sent packets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub okey: Option<u32>,
}

impl StaticTunnelConfig {
    /// The key the tunnel is registered under.
    #[must_use]
    pub const fn effective_key(&self) -> Option<u32> {
        match self.key {
            Some(key) => Some(key),
            None => self.ikey,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_netmask(&self.name, self.address, self.netmask)?;
        match (self.key, self.ikey, self.okey) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                Err(ConfigError::KeyModeConflict(self.name.clone()))
            }
            (None, Some(_), None) => Err(ConfigError::IncompleteKeyPair {
                name: self.name.clone(),
                present: "ikey",
                missing: "okey",
            }),
            (None, None, Some(_)) => Err(ConfigError::IncompleteKeyPair {
                name: self.name.clone(),
                present: "okey",
                missing: "ikey",
            }),
            _ => Ok(()),
        }
    }
}

/// A veth pair from another namespace into the overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VethConfig {
    /// Interface name.
    pub name: String,
    /// Namespace of the inner end; root when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_namespace: Option<String>,
    /// Bridge the outer end with a dummy device.
    #[serde(default)]
    pub outer_interface_bridged: bool,
    /// Address on the inner end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_address: Option<IpAddr>,
    /// Address on the outer end (or its bridge).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outer_address: Option<IpAddr>,
    /// Prefix length shared by both addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<u8>,
}

impl VethConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(inner), Some(outer)) = (self.inner_address, self.outer_address) {
            if !self.outer_interface_bridged {
                return Err(ConfigError::AddressesRequireBridge(self.name.clone()));
            }
            check_same_family(&self.name, inner, outer)?;
        }

        if let Some(address) = self.outer_address.or(self.inner_address) {
            let netmask = self
                .netmask
                .ok_or_else(|| ConfigError::MissingNetmask(self.name.clone()))?;
            validate_netmask(&self.name, address, netmask)?;
        }
        Ok(())
    }
}

/// A veth pair joining this overlay to another overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverlayLinkConfig {
    /// Interface name.
    pub name: String,
    /// The overlay the inner end is moved into.
    pub inner_overlay: String,
    /// Address on this overlay's side (on the bridge).
    pub outer_address: IpAddr,
    /// Address on the inner overlay's side.
    pub inner_address: IpAddr,
    /// Prefix length shared by both addresses.
    pub netmask: u8,
}

impl OverlayLinkConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_same_family(&self.name, self.inner_address, self.outer_address)?;
        validate_netmask(&self.name, self.inner_address, self.netmask)
    }
}

/// An 802.1Q VLAN on a physical interface, bridged into the overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VlanConfig {
    /// Interface name.
    pub name: String,
    /// VLAN ID.
    pub id: u16,
    /// Physical interface in the root namespace.
    pub physical_interface: String,
    /// Address in the overlay.
    pub address: IpAddr,
    /// Prefix length of `address`.
    pub netmask: u8,
}

impl VlanConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.id == 0 || self.id > 4094 {
            return Err(ConfigError::Invalid(format!(
                "interface '{}': VLAN ID {} out of range 1-4094",
                self.name, self.id
            )));
        }
        validate_netmask(&self.name, self.address, self.netmask)
    }
}

/// A tun or tap device in the overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TuntapConfig {
    /// Interface name.
    pub name: String,
    /// tun or tap.
    pub mode: TuntapMode,
    /// Owning user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// Owning group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Address of the device.
    pub address: IpAddr,
    /// Prefix length of `address`.
    pub netmask: u8,
}

/// A dummy device in the overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DummyConfig {
    /// Interface name.
    pub name: String,
    /// Address of the device.
    pub address: IpAddr,
    /// Prefix length of `address`.
    pub netmask: u8,
}

/// A configured interface, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InterfaceConfig {
    /// GRE/GRETAP tunnel.
    StaticTunnel(StaticTunnelConfig),
    /// veth pair.
    Veth(VethConfig),
    /// Link to another overlay.
    OverlayLink(OverlayLinkConfig),
    /// VLAN.
    Vlan(VlanConfig),
    /// tun/tap device.
    Tuntap(TuntapConfig),
    /// Dummy device.
    Dummy(DummyConfig),
}

impl InterfaceConfig {
    /// The configured interface name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::StaticTunnel(c) => &c.name,
            Self::Veth(c) => &c.name,
            Self::OverlayLink(c) => &c.name,
            Self::Vlan(c) => &c.name,
            Self::Tuntap(c) => &c.name,
            Self::Dummy(c) => &c.name,
        }
    }

    /// Validate the interface in isolation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::StaticTunnel(c) => c.validate(),
            Self::Veth(c) => c.validate(),
            Self::OverlayLink(c) => c.validate(),
            Self::Vlan(c) => c.validate(),
            Self::Tuntap(c) => validate_netmask(&c.name, c.address, c.netmask),
            Self::Dummy(c) => validate_netmask(&c.name, c.address, c.netmask),
        }
    }
}

/// Configuration of one overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Overlay name; also the name of its network namespace.
    pub name: String,
    /// Disabled overlays are loaded but never touch the kernel.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Full-mesh tunnel settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<MeshConfig>,
    /// Executable run inside the namespace once interfaces are up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fwbuilder_script: Option<PathBuf>,
    /// Statically configured interfaces, in start order.
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

impl OverlayConfig {
    /// Load an overlay from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = read(path.as_ref())?;
        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Invalid(msg) => {
                ConfigError::Invalid(format!("{}: {msg}", path.as_ref().display()))
            }
            other => other,
        })
    }

    /// Parse an overlay from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::Invalid(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse an overlay from its JSON runtime snapshot.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ConfigError::Invalid(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to the JSON runtime snapshot.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("unserializable overlay: {e}")))
    }

    /// Validate the overlay in isolation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("overlay name cannot be empty".to_string()));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "overlay name '{}' must contain only alphanumeric characters, hyphens, and underscores",
                self.name
            )));
        }

        if let Some(mesh) = &self.mesh {
            if !mesh.nodes.iter().any(|n| n.name == mesh.this_node) {
                return Err(ConfigError::MissingThisNode {
                    overlay: self.name.clone(),
                    node: mesh.this_node.clone(),
                });
            }
            let mut nodes = BTreeSet::new();
            for node in &mesh.nodes {
                if !nodes.insert(node.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "overlay '{}': mesh node '{}' listed more than once",
                        self.name, node.name
                    )));
                }
            }
        }

        let mut names = BTreeSet::new();
        for interface in &self.interfaces {
            if !names.insert(interface.name()) {
                return Err(ConfigError::Invalid(format!(
                    "overlay '{}': interface '{}' defined more than once",
                    self.name,
                    interface.name()
                )));
            }
            interface.validate()?;
        }

        Ok(())
    }
}

/// Load every `*.toml` overlay in a directory, sorted by file name.
///
/// # Errors
///
/// Returns an error if the directory cannot be read, any file fails to
/// load, or two files define the same overlay name.
pub fn load_overlays(dir: impl AsRef<Path>) -> Result<Vec<OverlayConfig>, ConfigError> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir).map_err(|e| {
        ConfigError::Invalid(format!(
            "failed to read overlay directory '{}': {e}",
            dir.display()
        ))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut seen = BTreeSet::new();
    let mut overlays = Vec::with_capacity(paths.len());
    for path in paths {
        let overlay = OverlayConfig::from_file(&path)?;
        if !seen.insert(overlay.name.clone()) {
            return Err(ConfigError::DuplicateOverlay(overlay.name));
        }
        overlays.push(overlay);
    }
    Ok(overlays)
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Invalid(format!(
            "failed to read config file '{}': {e}",
            path.display()
        ))
    })
}

fn check_same_family(name: &str, first: IpAddr, second: IpAddr) -> Result<(), ConfigError> {
    if first.is_ipv6() == second.is_ipv6() {
        Ok(())
    } else {
        Err(ConfigError::AddressFamilyMismatch {
            name: name.to_string(),
            first,
            second,
        })
    }
}

fn validate_netmask(name: &str, address: IpAddr, netmask: u8) -> Result<(), ConfigError> {
    let max = if address.is_ipv6() { 128 } else { 32 };
    if netmask > max {
        return Err(ConfigError::InvalidNetmask {
            name: name.to_string(),
            address,
            netmask,
        });
    }
    Ok(())
}
