//! In-memory netlink backend.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;

use parking_lot::Mutex;
use tracing::debug;

use super::{Link, LinkKind, LinkParams, LinkSpec, Netlink, NetlinkResult, Process};
use crate::error::ResourceError;

type DeviceKey = (Option<String>, String);

/// A primitive recorded by [`DryRunNetlink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Device created.
    Create {
        /// Namespace.
        netns: Option<String>,
        /// Device name.
        name: String,
        /// Device kind.
        kind: LinkKind,
    },
    /// Device removed.
    Remove {
        /// Namespace.
        netns: Option<String>,
        /// Device name.
        name: String,
    },
    /// Address added.
    AddIp {
        /// Namespace.
        netns: Option<String>,
        /// Device name.
        name: String,
        /// Address.
        address: IpAddr,
        /// Prefix length.
        prefix_len: u8,
    },
    /// Device set up.
    SetUp {
        /// Namespace.
        netns: Option<String>,
        /// Device name.
        name: String,
    },
    /// Device moved between namespaces.
    SetNamespace {
        /// Device name.
        name: String,
        /// Source namespace.
        from: Option<String>,
        /// Destination namespace.
        to: Option<String>,
    },
    /// Device attached to a bridge.
    SetMaster {
        /// Namespace.
        netns: Option<String>,
        /// Device name.
        name: String,
        /// Bridge name.
        bridge: String,
    },
    /// Pending changes committed.
    Commit {
        /// Namespace.
        netns: Option<String>,
    },
    /// Namespace created.
    NamespaceCreate(String),
    /// Namespace removed.
    NamespaceRemove(String),
    /// Process spawned.
    Popen {
        /// Namespace.
        netns: Option<String>,
        /// Command line.
        argv: Vec<String>,
    },
}

#[derive(Debug, Clone)]
struct Device {
    kind: LinkKind,
    addresses: BTreeSet<(IpAddr, u8)>,
    up: bool,
    master: Option<String>,
    peer: Option<DeviceKey>,
}

impl Device {
    fn new(kind: LinkKind) -> Self {
        Self {
            kind,
            addresses: BTreeSet::new(),
            up: false,
            master: None,
            peer: None,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeSet<String>,
    devices: BTreeMap<DeviceKey, Device>,
    journal: Vec<Operation>,
    failing: HashSet<String>,
    process_status: i32,
}

impl State {
    fn check_namespace(&self, netns: Option<&str>) -> NetlinkResult<()> {
        match netns {
            Some(name) if !self.namespaces.contains(name) => Err(ResourceError::NotFound {
                kind: "namespace",
                name: name.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn device(&self, key: &DeviceKey) -> NetlinkResult<&Device> {
        self.devices.get(key).ok_or_else(|| not_found(&key.1))
    }

    fn device_mut(&mut self, key: &DeviceKey) -> NetlinkResult<&mut Device> {
        self.devices.get_mut(key).ok_or_else(|| not_found(&key.1))
    }

    fn insert(&mut self, key: DeviceKey, device: Device) -> NetlinkResult<()> {
        if self.devices.contains_key(&key) {
            return Err(ResourceError::AlreadyExists {
                kind: "link",
                name: key.1,
            });
        }
        self.devices.insert(key, device);
        Ok(())
    }

    /// Drop a device, its veth peer, and any bridge memberships on it.
    fn destroy(&mut self, key: &DeviceKey) {
        let Some(device) = self.devices.remove(key) else {
            return;
        };
        if let Some(peer) = device.peer {
            self.devices.remove(&peer);
        }
        if device.kind == LinkKind::Bridge {
            for (port_key, port) in &mut self.devices {
                if port_key.0 == key.0 && port.master.as_deref() == Some(key.1.as_str()) {
                    port.master = None;
                }
            }
        }
    }
}

fn key(netns: Option<&str>, name: &str) -> DeviceKey {
    (netns.map(str::to_string), name.to_string())
}

fn link_key(link: &Link) -> DeviceKey {
    (link.netns.clone(), link.name.clone())
}

fn not_found(name: &str) -> ResourceError {
    ResourceError::NotFound {
        kind: "link",
        name: name.to_string(),
    }
}

/// Netlink backend that models namespaces and devices in memory.
///
/// Every primitive is appended to an operation journal. Creation of
/// specific device names can be made to fail, to exercise error paths.
#[derive(Debug, Default)]
pub struct DryRunNetlink {
    state: Mutex<State>,
}

impl DryRunNetlink {
    /// An empty host with only the root namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a physical device in the root namespace.
    pub fn add_physical(&self, name: &str) {
        self.state
            .lock()
            .devices
            .insert(key(None, name), Device::new(LinkKind::Physical));
    }

    /// Make every later `create` of `name` fail.
    pub fn fail_create(&self, name: &str) {
        self.state.lock().failing.insert(name.to_string());
    }

    /// Exit status reported by spawned processes (default 0).
    pub fn set_process_status(&self, status: i32) {
        self.state.lock().process_status = status;
    }

    /// Every primitive applied so far, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().journal.clone()
    }

    /// Named namespaces currently present.
    #[must_use]
    pub fn namespaces(&self) -> BTreeSet<String> {
        self.state.lock().namespaces.clone()
    }

    /// Names of the devices in a namespace.
    #[must_use]
    pub fn links(&self, netns: Option<&str>) -> Vec<String> {
        self.state
            .lock()
            .devices
            .keys()
            .filter(|(ns, _)| ns.as_deref() == netns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Whether a device exists.
    #[must_use]
    pub fn has_link(&self, netns: Option<&str>, name: &str) -> bool {
        self.state.lock().devices.contains_key(&key(netns, name))
    }

    /// Addresses on a device.
    #[must_use]
    pub fn addresses(&self, netns: Option<&str>, name: &str) -> Vec<(IpAddr, u8)> {
        self.state
            .lock()
            .devices
            .get(&key(netns, name))
            .map(|d| d.addresses.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a device is up.
    #[must_use]
    pub fn is_up(&self, netns: Option<&str>, name: &str) -> bool {
        self.state
            .lock()
            .devices
            .get(&key(netns, name))
            .is_some_and(|d| d.up)
    }
}

impl Netlink for DryRunNetlink {
    fn create(&self, netns: Option<&str>, spec: &LinkSpec) -> NetlinkResult<Link> {
        let mut state = self.state.lock();
        state.check_namespace(netns)?;

        if state.failing.contains(&spec.name) {
            return Err(ResourceError::CommandFailed {
                command: format!("create {}", spec.name),
                message: "injected failure".to_string(),
            });
        }

        let kind = spec.kind();
        let own_key = key(netns, &spec.name);

        match &spec.params {
            LinkParams::Veth { peer } => {
                let peer_key = key(netns, peer);
                if state.devices.contains_key(&peer_key) {
                    return Err(ResourceError::AlreadyExists {
                        kind: "link",
                        name: peer.clone(),
                    });
                }
                let mut own = Device::new(LinkKind::Veth);
                own.peer = Some(peer_key.clone());
                state.insert(own_key.clone(), own)?;
                let mut other = Device::new(LinkKind::Veth);
                other.peer = Some(own_key);
                state.devices.insert(peer_key, other);
            }
            LinkParams::Vlan { parent, .. } => {
                state.device(&key(netns, parent))?;
                state.insert(own_key, Device::new(kind.clone()))?;
            }
            _ => state.insert(own_key, Device::new(kind.clone()))?,
        }

        debug!(netns = ?netns, name = %spec.name, %kind, "dry-run create");
        state.journal.push(Operation::Create {
            netns: netns.map(str::to_string),
            name: spec.name.clone(),
            kind: kind.clone(),
        });

        Ok(Link {
            name: spec.name.clone(),
            netns: netns.map(str::to_string),
            kind,
        })
    }

    fn get(&self, netns: Option<&str>, name: &str) -> NetlinkResult<Link> {
        let state = self.state.lock();
        state.check_namespace(netns)?;
        let device = state.device(&key(netns, name))?;
        Ok(Link {
            name: name.to_string(),
            netns: netns.map(str::to_string),
            kind: device.kind.clone(),
        })
    }

    fn remove(&self, link: &Link) -> NetlinkResult<()> {
        let mut state = self.state.lock();
        let link_key = link_key(link);
        state.device(&link_key)?;
        state.destroy(&link_key);
        state.journal.push(Operation::Remove {
            netns: link.netns.clone(),
            name: link.name.clone(),
        });
        Ok(())
    }

    fn add_ip(&self, link: &Link, address: IpAddr, prefix_len: u8) -> NetlinkResult<()> {
        let mut state = self.state.lock();
        state
            .device_mut(&link_key(link))?
            .addresses
            .insert((address, prefix_len));
        state.journal.push(Operation::AddIp {
            netns: link.netns.clone(),
            name: link.name.clone(),
            address,
            prefix_len,
        });
        Ok(())
    }

    fn set_up(&self, link: &Link) -> NetlinkResult<()> {
        let mut state = self.state.lock();
        state.device_mut(&link_key(link))?.up = true;
        state.journal.push(Operation::SetUp {
            netns: link.netns.clone(),
            name: link.name.clone(),
        });
        Ok(())
    }

    fn set_namespace(&self, link: &Link, netns: Option<&str>) -> NetlinkResult<Link> {
        let mut state = self.state.lock();
        state.check_namespace(netns)?;

        let from = link_key(link);
        let to = key(netns, &link.name);
        if from == to {
            return Ok(link.clone());
        }
        if state.devices.contains_key(&to) {
            return Err(ResourceError::AlreadyExists {
                kind: "link",
                name: link.name.clone(),
            });
        }

        let mut device = state.devices.remove(&from).ok_or_else(|| not_found(&link.name))?;
        // The kernel flushes addresses, state and bridge membership on a move.
        device.addresses.clear();
        device.up = false;
        device.master = None;
        if let Some(peer) = &device.peer {
            if let Some(peer_device) = state.devices.get_mut(peer) {
                peer_device.peer = Some(to.clone());
            }
        }
        let kind = device.kind.clone();
        state.devices.insert(to, device);

        state.journal.push(Operation::SetNamespace {
            name: link.name.clone(),
            from: link.netns.clone(),
            to: netns.map(str::to_string),
        });

        Ok(Link {
            name: link.name.clone(),
            netns: netns.map(str::to_string),
            kind,
        })
    }

    fn set_master(&self, link: &Link, bridge: &Link) -> NetlinkResult<()> {
        let mut state = self.state.lock();
        let bridge_device = state.device(&link_key(bridge))?;
        if bridge_device.kind != LinkKind::Bridge || bridge.netns != link.netns {
            return Err(ResourceError::CommandFailed {
                command: format!("set {} master {}", link.name, bridge.name),
                message: "not a bridge in the same namespace".to_string(),
            });
        }
        state.device_mut(&link_key(link))?.master = Some(bridge.name.clone());
        state.journal.push(Operation::SetMaster {
            netns: link.netns.clone(),
            name: link.name.clone(),
            bridge: bridge.name.clone(),
        });
        Ok(())
    }

    fn master(&self, link: &Link) -> NetlinkResult<Option<String>> {
        Ok(self.state.lock().device(&link_key(link))?.master.clone())
    }

    fn commit(&self, netns: Option<&str>) -> NetlinkResult<()> {
        self.state.lock().journal.push(Operation::Commit {
            netns: netns.map(str::to_string),
        });
        Ok(())
    }

    fn namespace_create(&self, name: &str) -> NetlinkResult<()> {
        let mut state = self.state.lock();
        if state.namespaces.insert(name.to_string()) {
            state.journal.push(Operation::NamespaceCreate(name.to_string()));
        }
        Ok(())
    }

    fn namespace_remove(&self, name: &str) -> NetlinkResult<()> {
        let mut state = self.state.lock();
        if !state.namespaces.remove(name) {
            return Err(ResourceError::NotFound {
                kind: "namespace",
                name: name.to_string(),
            });
        }
        let doomed: Vec<DeviceKey> = state
            .devices
            .keys()
            .filter(|(ns, _)| ns.as_deref() == Some(name))
            .cloned()
            .collect();
        for device_key in &doomed {
            state.destroy(device_key);
        }
        state.journal.push(Operation::NamespaceRemove(name.to_string()));
        Ok(())
    }

    fn namespace_list(&self) -> NetlinkResult<BTreeSet<String>> {
        Ok(self.state.lock().namespaces.clone())
    }

    fn popen(&self, netns: Option<&str>, argv: &[String]) -> NetlinkResult<Box<dyn Process>> {
        let mut state = self.state.lock();
        state.check_namespace(netns)?;
        state.journal.push(Operation::Popen {
            netns: netns.map(str::to_string),
            argv: argv.to_vec(),
        });
        Ok(Box::new(StubProcess {
            status: state.process_status,
        }))
    }
}

/// Process that has already exited with a fixed status.
#[derive(Debug)]
struct StubProcess {
    status: i32,
}

impl Process for StubProcess {
    fn wait(&mut self) -> NetlinkResult<i32> {
        Ok(self.status)
    }

    fn release(&mut self) {}
}
