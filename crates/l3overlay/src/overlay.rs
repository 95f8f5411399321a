//! Overlays: one network namespace and the interfaces composed into it.
//!
//! An overlay is built from its [`OverlayConfig`] in two steps. Construction
//! is pure: it derives the mesh tunnels and wraps every configured
//! interface. [`Overlay::setup`] then binds everything to the daemon's
//! allocators and netlink backend, so names and keys are reserved before
//! any overlay touches the kernel.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{debug, info};

use crate::allocator::Allocators;
use crate::config::{DaemonConfig, MeshConfig, MeshNode, OverlayConfig};
use crate::error::{ConfigError, ResourceError, Result, StateError};
use crate::interface::{Env, Interface, InterfaceVariant, MeshTunnel, SetupContext};
use crate::ipsec::MeshLinkRegistry;
use crate::netlink::Netlink;
use crate::netns::{NamespaceHandle, NetworkNamespace};
use crate::worker::{Worker, WorkerState};

/// File holding the running overlay's configuration inside its runtime
/// directory.
pub const OVERLAY_SNAPSHOT: &str = "overlay.json";

/// A named overlay network.
#[derive(Debug)]
pub struct Overlay {
    config: OverlayConfig,
    worker: WorkerState,
    dry_run: bool,
    root_dir: PathBuf,
    fwbuilder_script: Option<PathBuf>,
    interfaces: Vec<Interface>,
    netns: Option<NetworkNamespace>,
}

impl Overlay {
    /// Build an overlay, generating its mesh tunnels.
    ///
    /// # Errors
    ///
    /// Returns an error if the linknet pool cannot address every mesh link
    /// originating on this node.
    pub fn new(
        config: OverlayConfig,
        daemon: &DaemonConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let mut interfaces = match &config.mesh {
            Some(mesh) => mesh_tunnels(&config.name, mesh)?
                .into_iter()
                .map(|t| Interface::new(InterfaceVariant::MeshTunnel(t)))
                .collect(),
            None => Vec::new(),
        };
        interfaces.extend(config.interfaces.iter().cloned().map(Interface::from_config));

        Ok(Self {
            worker: WorkerState::with_setup(format!("overlay '{}'", config.name)),
            dry_run: daemon.dry_run,
            root_dir: daemon.overlay_dir(&config.name),
            fwbuilder_script: config
                .fwbuilder_script
                .as_deref()
                .map(|script| daemon.resolve_script(script)),
            interfaces,
            netns: None,
            config,
        })
    }

    /// Overlay name, also the name of its namespace.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether the overlay takes part in the lifecycle.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// The configuration the overlay was built from.
    #[must_use]
    pub const fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Interfaces in start order: mesh tunnels, then configured ones.
    #[must_use]
    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Runtime directory.
    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Resolved firewall script path.
    #[must_use]
    pub fn fwbuilder_script(&self) -> Option<&Path> {
        self.fwbuilder_script.as_deref()
    }

    /// Validate the configuration and bind every interface to the daemon's
    /// shared state.
    pub fn setup(
        &mut self,
        netlink: Arc<dyn Netlink>,
        allocators: &Allocators,
        mesh_links: &Arc<MeshLinkRegistry>,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.worker.check_setup()?;
        self.config.validate()?;

        let ctx = SetupContext::new(self.name(), allocators.clone(), Arc::clone(mesh_links));
        for interface in &mut self.interfaces {
            interface.setup(&ctx)?;
        }
        self.netns = Some(NetworkNamespace::named(self.name(), netlink));

        self.worker.finish_setup()?;
        Ok(())
    }

    /// Create the namespace and start every interface.
    pub fn start(&mut self, root: &NamespaceHandle) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.worker.begin_start()?;
        info!(overlay = %self.name(), "starting overlay");

        let netns = self.netns_mut()?;
        netns.start()?;
        let handle = netns.handle()?.clone();

        if !self.dry_run {
            debug!(
                overlay = %self.name(),
                dir = %self.root_dir.display(),
                "creating overlay root directory"
            );
            std::fs::create_dir_all(&self.root_dir)?;
            std::fs::write(self.root_dir.join(OVERLAY_SNAPSHOT), self.config.to_json()?)?;
        }

        let env = Env {
            root,
            overlay: &handle,
        };
        for interface in &mut self.interfaces {
            interface.start(&env)?;
        }

        self.run_fwbuilder_script()?;
        self.netns_mut()?.stop()?;

        self.worker.finish_start();
        info!(overlay = %self.name(), "finished starting overlay");
        Ok(())
    }

    /// Stop every interface, in reverse order.
    pub fn stop(&mut self, root: &NamespaceHandle) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.worker.begin_stop()?;
        info!(overlay = %self.name(), "stopping overlay");

        let netns = self.netns_mut()?;
        netns.start()?;
        let handle = netns.handle()?.clone();

        let env = Env {
            root,
            overlay: &handle,
        };
        for interface in self.interfaces.iter_mut().rev() {
            interface.stop(&env)?;
        }

        self.netns_mut()?.stop()?;
        self.remove_root_dir()?;

        self.worker.finish_stop();
        info!(overlay = %self.name(), "finished stopping overlay");
        Ok(())
    }

    /// Release reservations and delete the namespace.
    pub fn remove(&mut self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.worker.begin_remove()?;

        for interface in self.interfaces.iter_mut().rev() {
            interface.remove()?;
        }
        if let Some(netns) = &mut self.netns {
            netns.remove()?;
        }

        self.worker.finish_remove();
        debug!(overlay = %self.name(), "removed overlay");
        Ok(())
    }

    /// Tear down whatever a previous process left behind for this overlay.
    ///
    /// The overlay must be set up and never started; its kernel objects are
    /// deleted where present, then the namespace and runtime directory go.
    pub fn clear_stale(&mut self, root: &NamespaceHandle) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if !self.worker.is_setup() {
            return Err(StateError::NotSetup(self.worker.description().to_string()).into());
        }
        info!(overlay = %self.name(), "clearing stale overlay");

        let netns = self.netns_mut()?;
        netns.start()?;
        let handle = netns.handle()?.clone();

        let env = Env {
            root,
            overlay: &handle,
        };
        for interface in self.interfaces.iter_mut().rev() {
            interface.teardown(&env)?;
        }

        let netns = self.netns_mut()?;
        netns.stop()?;
        netns.remove()?;
        self.remove_root_dir()
    }

    fn netns_mut(&mut self) -> Result<&mut NetworkNamespace> {
        let description = self.worker.description();
        match &mut self.netns {
            Some(netns) => Ok(netns),
            None => Err(StateError::NotSetup(description.to_string()).into()),
        }
    }

    fn run_fwbuilder_script(&self) -> Result<()> {
        let (Some(script), Some(netns)) = (&self.fwbuilder_script, &self.netns) else {
            return Ok(());
        };

        let command = script.display().to_string();
        info!(overlay = %self.name(), script = %command, "running firewall script");

        let mut process = netns.spawn(&[command.clone()])?;
        let status = process.wait();
        process.release();

        match status? {
            0 => Ok(()),
            status => Err(ResourceError::ProcessFailed { command, status }.into()),
        }
    }

    fn remove_root_dir(&self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        debug!(
            overlay = %self.name(),
            dir = %self.root_dir.display(),
            "removing overlay root directory"
        );
        match std::fs::remove_dir_all(&self.root_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Worker for Overlay {
    fn worker(&self) -> &WorkerState {
        &self.worker
    }
}

/// Enumerate the links of a mesh in both directions, each link followed by
/// its reverse. A node only ever links to the nodes listed before it, so
/// appending nodes appends links without renumbering existing ones.
fn node_links(nodes: &[MeshNode]) -> Vec<(&MeshNode, &MeshNode)> {
    let mut links = Vec::new();
    for (i, peer) in nodes.iter().enumerate() {
        for added in &nodes[..i] {
            links.push((added, peer));
            links.push((peer, added));
        }
    }
    links
}

/// The mesh tunnels originating on this node.
fn mesh_tunnels(
    overlay: &str,
    mesh: &MeshConfig,
) -> std::result::Result<Vec<MeshTunnel>, ConfigError> {
    let this_node = mesh
        .nodes
        .iter()
        .find(|n| n.name == mesh.this_node)
        .ok_or_else(|| ConfigError::MissingThisNode {
            overlay: overlay.to_string(),
            node: mesh.this_node.clone(),
        })?;

    let mut tunnels = Vec::new();
    for (i, (local, remote)) in node_links(&mesh.nodes).into_iter().enumerate() {
        if local.name != this_node.name {
            continue;
        }

        let (virtual_local, virtual_remote) =
            linknet_addresses(&mesh.linknet_pool, i).ok_or_else(|| {
                ConfigError::LinknetPoolOverflow {
                    overlay: overlay.to_string(),
                    pool: mesh.linknet_pool.to_string(),
                    local: local.name.clone(),
                    remote: remote.name.clone(),
                }
            })?;

        tunnels.push(MeshTunnel::new(
            format!("m{}l{}", mesh.asn, i / 2),
            &local.name,
            &remote.name,
            this_node.address,
            remote.address,
            virtual_local,
            virtual_remote,
        ));
    }
    Ok(tunnels)
}

/// Address `offset` of the pool and its point-to-point partner, or `None`
/// if either lies past the pool's last address.
fn linknet_addresses(pool: &IpNet, offset: usize) -> Option<(IpAddr, IpAddr)> {
    match pool {
        IpNet::V4(net) => {
            let local = u32::from(net.network()).checked_add(u32::try_from(offset).ok()?)?;
            let remote = local ^ 1;
            let last = u32::from(net.broadcast());
            (local <= last && remote <= last)
                .then(|| (Ipv4Addr::from(local).into(), Ipv4Addr::from(remote).into()))
        }
        IpNet::V6(net) => {
            let local = u128::from(net.network()).checked_add(u128::try_from(offset).ok()?)?;
            let remote = local ^ 1;
            let last = u128::from(net.broadcast());
            (local <= last && remote <= last)
                .then(|| (Ipv6Addr::from(local).into(), Ipv6Addr::from(remote).into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DummyConfig, InterfaceConfig};
    use crate::error::Error;
    use crate::interface::InterfaceOps;
    use crate::netlink::DryRunNetlink;
    use tempfile::TempDir;
    use test_case::test_case;

    fn node(name: &str, address: &str) -> MeshNode {
        MeshNode {
            name: name.to_string(),
            address: address.parse().expect("ip"),
        }
    }

    fn mesh(this_node: &str, pool: &str) -> MeshConfig {
        MeshConfig {
            asn: 65000,
            linknet_pool: pool.parse().expect("pool"),
            this_node: this_node.to_string(),
            nodes: vec![
                node("a", "192.0.2.1"),
                node("b", "192.0.2.2"),
                node("c", "192.0.2.3"),
            ],
        }
    }

    fn overlay_config(name: &str) -> OverlayConfig {
        OverlayConfig {
            name: name.to_string(),
            enabled: true,
            mesh: None,
            fwbuilder_script: None,
            interfaces: vec![InterfaceConfig::Dummy(DummyConfig {
                name: "lo".to_string(),
                address: "10.255.0.1".parse().expect("ip"),
                netmask: 32,
            })],
        }
    }

    struct Fixture {
        netlink: Arc<DryRunNetlink>,
        root: NetworkNamespace,
        allocators: Allocators,
        mesh_links: Arc<MeshLinkRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let netlink = Arc::new(DryRunNetlink::new());
            let mut root = NetworkNamespace::root(netlink.clone());
            root.start().expect("root");
            Self {
                netlink,
                root,
                allocators: Allocators::new(),
                mesh_links: Arc::new(MeshLinkRegistry::new()),
            }
        }

        fn setup(&self, overlay: &mut Overlay) {
            overlay
                .setup(self.netlink.clone(), &self.allocators, &self.mesh_links)
                .expect("setup");
        }

        fn root(&self) -> &NamespaceHandle {
            self.root.handle().expect("root handle")
        }
    }

    fn dry_run_daemon() -> DaemonConfig {
        DaemonConfig {
            dry_run: true,
            ..DaemonConfig::default()
        }
    }

    #[test]
    fn test_node_links_append_in_pairs() {
        let nodes = mesh("a", "198.51.100.0/24").nodes;
        let links: Vec<(&str, &str)> = node_links(&nodes)
            .into_iter()
            .map(|(l, r)| (l.name.as_str(), r.name.as_str()))
            .collect();
        assert_eq!(
            links,
            vec![("a", "b"), ("b", "a"), ("a", "c"), ("c", "a"), ("b", "c"), ("c", "b")]
        );
    }

    #[test_case("a", &[("m65000l0", "198.51.100.0", "198.51.100.1"), ("m65000l1", "198.51.100.2", "198.51.100.3")] ; "first node")]
    #[test_case("c", &[("m65000l1", "198.51.100.3", "198.51.100.2"), ("m65000l2", "198.51.100.5", "198.51.100.4")] ; "last node")]
    fn test_mesh_tunnels_for_node(this_node: &str, expected: &[(&str, &str, &str)]) {
        let tunnels = mesh_tunnels("ov1", &mesh(this_node, "198.51.100.0/24")).expect("mesh");
        let actual: Vec<(String, IpAddr, IpAddr)> = tunnels
            .iter()
            .map(|t| {
                let (local, remote) = t.virtual_addresses();
                (t.name().to_string(), local, remote)
            })
            .collect();
        let expected: Vec<(String, IpAddr, IpAddr)> = expected
            .iter()
            .map(|(n, l, r)| (n.to_string(), l.parse().expect("ip"), r.parse().expect("ip")))
            .collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_mesh_tunnel_physical_endpoints() {
        let tunnels = mesh_tunnels("ov1", &mesh("b", "198.51.100.0/24")).expect("mesh");
        assert_eq!(tunnels.len(), 2);
        assert_eq!(tunnels[0].nodes(), ("b", "a"));
        assert_eq!(
            tunnels[0].physical(),
            ("192.0.2.2".parse().expect("ip"), "192.0.2.1".parse().expect("ip"))
        );
        assert_eq!(tunnels[1].nodes(), ("b", "c"));
    }

    #[test]
    fn test_linknet_pool_overflow() {
        // Three nodes need six addresses; a /30 holds four.
        let result = mesh_tunnels("ov1", &mesh("c", "198.51.100.0/30"));
        assert!(matches!(
            result,
            Err(ConfigError::LinknetPoolOverflow { ref local, .. }) if local == "c"
        ));
    }

    #[test]
    fn test_ipv6_linknet() {
        let tunnels = mesh_tunnels("ov1", &mesh("b", "2001:db8::/64")).expect("mesh");
        assert_eq!(
            tunnels[0].virtual_addresses(),
            ("2001:db8::1".parse().expect("ip"), "2001:db8::".parse().expect("ip"))
        );
        assert_eq!(tunnels[0].virtual_netmask(), 127);
    }

    #[test]
    fn test_mesh_tunnels_come_first() {
        let mut config = overlay_config("ov1");
        config.mesh = Some(mesh("a", "198.51.100.0/24"));
        let overlay = Overlay::new(config, &dry_run_daemon()).expect("overlay");
        let kinds: Vec<&str> = overlay
            .interfaces()
            .iter()
            .map(|i| i.variant().description())
            .collect();
        assert_eq!(kinds, vec!["mesh tunnel", "mesh tunnel", "static dummy"]);
    }

    #[test]
    fn test_relative_script_resolves_against_script_dir() {
        let mut config = overlay_config("ov1");
        config.fwbuilder_script = Some(PathBuf::from("ov1.fw"));
        let daemon = DaemonConfig {
            fwbuilder_script_dir: Some(PathBuf::from("/etc/l3overlay/fw")),
            ..dry_run_daemon()
        };
        let overlay = Overlay::new(config, &daemon).expect("overlay");
        assert_eq!(
            overlay.fwbuilder_script(),
            Some(Path::new("/etc/l3overlay/fw/ov1.fw"))
        );
    }

    #[test]
    fn test_lifecycle_in_dry_run() {
        let fx = Fixture::new();
        let mut overlay = Overlay::new(overlay_config("ov1"), &dry_run_daemon()).expect("overlay");
        fx.setup(&mut overlay);

        overlay.start(fx.root()).expect("start");
        assert!(overlay.is_started());
        assert!(fx.netlink.namespaces().contains("ov1"));
        assert_eq!(fx.netlink.links(Some("ov1")), vec!["lo0".to_string()]);

        overlay.stop(fx.root()).expect("stop");
        assert!(fx.netlink.links(Some("ov1")).is_empty());
        assert!(fx.netlink.namespaces().contains("ov1"));

        overlay.remove().expect("remove");
        assert!(overlay.is_removed());
        assert!(!fx.netlink.namespaces().contains("ov1"));
    }

    #[test]
    fn test_start_before_setup_fails() {
        let fx = Fixture::new();
        let mut overlay = Overlay::new(overlay_config("ov1"), &dry_run_daemon()).expect("overlay");
        assert!(matches!(
            overlay.start(fx.root()),
            Err(Error::State(StateError::NotSetup(_)))
        ));
    }

    #[test]
    fn test_disabled_overlay_is_inert() {
        let fx = Fixture::new();
        let mut config = overlay_config("ov1");
        config.enabled = false;
        let mut overlay = Overlay::new(config, &dry_run_daemon()).expect("overlay");

        fx.setup(&mut overlay);
        overlay.start(fx.root()).expect("start");
        overlay.stop(fx.root()).expect("stop");
        overlay.remove().expect("remove");

        assert!(!overlay.is_started());
        assert!(fx.netlink.operations().is_empty());
    }

    #[test]
    fn test_runtime_directory_holds_snapshot() {
        let fx = Fixture::new();
        let lib = TempDir::new().expect("tempdir");
        let daemon = DaemonConfig {
            lib_dir: lib.path().to_path_buf(),
            ..DaemonConfig::default()
        };
        let mut overlay = Overlay::new(overlay_config("ov1"), &daemon).expect("overlay");
        fx.setup(&mut overlay);

        overlay.start(fx.root()).expect("start");
        let snapshot = std::fs::read_to_string(overlay.root_dir().join(OVERLAY_SNAPSHOT))
            .expect("snapshot written");
        assert_eq!(
            OverlayConfig::from_json(&snapshot).expect("parse"),
            overlay_config("ov1")
        );

        overlay.stop(fx.root()).expect("stop");
        assert!(!overlay.root_dir().exists());
    }

    #[test]
    fn test_failing_firewall_script() {
        let fx = Fixture::new();
        fx.netlink.set_process_status(2);
        let mut config = overlay_config("ov1");
        config.fwbuilder_script = Some(PathBuf::from("/usr/local/bin/fw"));
        let mut overlay = Overlay::new(config, &dry_run_daemon()).expect("overlay");
        fx.setup(&mut overlay);

        assert!(matches!(
            overlay.start(fx.root()),
            Err(Error::Resource(ResourceError::ProcessFailed { status: 2, .. }))
        ));
        assert!(overlay.is_starting());
    }

    #[test]
    fn test_clear_stale_removes_leftovers() {
        let fx = Fixture::new();
        let mut first = Overlay::new(overlay_config("ov1"), &dry_run_daemon()).expect("overlay");
        fx.setup(&mut first);
        first.start(fx.root()).expect("start");

        // A fresh process rebuilds the overlay from scratch.
        let mut stale = Overlay::new(overlay_config("ov1"), &dry_run_daemon()).expect("overlay");
        stale
            .setup(fx.netlink.clone(), &Allocators::new(), &Arc::new(MeshLinkRegistry::new()))
            .expect("setup");
        stale.clear_stale(fx.root()).expect("clear");

        assert!(!fx.netlink.namespaces().contains("ov1"));
    }
}
