//! The daemon: every overlay on this node, driven in dependency order.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::allocator::Allocators;
use crate::config::{DaemonConfig, OverlayConfig};
use crate::error::{ConfigError, Result};
use crate::ipsec::{IpsecControl, IpsecProcess, MeshLinkRegistry};
use crate::netlink::Netlink;
use crate::netns::{NamespaceHandle, NetworkNamespace};
use crate::overlay::{Overlay, OVERLAY_SNAPSHOT};
use crate::resolver;
use crate::worker::{Worker, WorkerState};

/// Top-level orchestrator.
///
/// The daemon owns the allocators, the mesh link registry and the root
/// namespace, and is the only place that knows the order overlays must be
/// started in. Failures are logged with the overlay they came from and
/// returned; the daemon never exits the process.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    netlink: Arc<dyn Netlink>,
    worker: WorkerState,
    allocators: Allocators,
    mesh_links: Arc<MeshLinkRegistry>,
    root: NetworkNamespace,
    overlays: BTreeMap<String, Overlay>,
    order: Vec<String>,
    ipsec: IpsecProcess,
}

impl Daemon {
    /// Build the daemon and resolve the overlay start order.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate overlay names, mesh generation
    /// failures, overlay links to unknown overlays and dependency cycles.
    pub fn new(
        config: DaemonConfig,
        overlay_configs: Vec<OverlayConfig>,
        netlink: Arc<dyn Netlink>,
        ipsec: Box<dyn IpsecControl>,
    ) -> Result<Self> {
        let mut overlays = BTreeMap::new();
        for overlay_config in overlay_configs {
            let name = overlay_config.name.clone();
            if overlays.contains_key(&name) {
                return Err(ConfigError::DuplicateOverlay(name).into());
            }
            overlays.insert(name, Overlay::new(overlay_config, &config)?);
        }

        let order = resolver::resolve(&overlays)?;
        debug!(order = ?order, "resolved overlay order");

        Ok(Self {
            root: NetworkNamespace::root(Arc::clone(&netlink)),
            worker: WorkerState::with_setup("daemon"),
            allocators: Allocators::new(),
            mesh_links: Arc::new(MeshLinkRegistry::new()),
            ipsec: IpsecProcess::new(ipsec),
            config,
            netlink,
            overlays,
            order,
        })
    }

    /// The daemon configuration.
    #[must_use]
    pub const fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Overlay names in start order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Look up an overlay by name.
    #[must_use]
    pub fn overlay(&self, name: &str) -> Option<&Overlay> {
        self.overlays.get(name)
    }

    /// The shared allocators.
    #[must_use]
    pub const fn allocators(&self) -> &Allocators {
        &self.allocators
    }

    /// The mesh link registry.
    #[must_use]
    pub fn mesh_links(&self) -> &MeshLinkRegistry {
        &self.mesh_links
    }

    /// The IPsec process.
    #[must_use]
    pub const fn ipsec(&self) -> &IpsecProcess {
        &self.ipsec
    }

    /// Set up every overlay in dependency order.
    pub fn setup(&mut self) -> Result<()> {
        self.worker.check_setup()?;
        info!(overlays = self.overlays.len(), "setting up daemon");

        for name in &self.order {
            let Some(overlay) = self.overlays.get_mut(name) else {
                continue;
            };
            overlay
                .setup(Arc::clone(&self.netlink), &self.allocators, &self.mesh_links)
                .inspect_err(|e| error!(overlay = %name, error = %e, "failed to set up overlay"))?;
        }

        self.worker.finish_setup()?;
        Ok(())
    }

    /// Start the root namespace, then every overlay followed by the IPsec
    /// process. Outside dry run, overlays left behind by a previous process
    /// are cleared first.
    pub fn start(&mut self) -> Result<()> {
        self.worker.begin_start()?;
        info!(dry_run = self.config.dry_run, "starting daemon");

        self.root.start()?;
        let root = self.root.handle()?.clone();

        if !self.config.dry_run {
            self.clear_stale(&root)?;
            debug!(dir = %self.config.lib_dir.display(), "creating lib dir");
            std::fs::create_dir_all(&self.config.lib_dir)?;
        }

        for name in &self.order {
            let Some(overlay) = self.overlays.get_mut(name) else {
                continue;
            };
            overlay
                .start(&root)
                .inspect_err(|e| error!(overlay = %name, error = %e, "failed to start overlay"))?;
        }

        self.ipsec.start(&self.mesh_links)?;

        self.worker.finish_start();
        info!("finished starting daemon");
        Ok(())
    }

    /// Stop the IPsec process and every overlay, in reverse order.
    pub fn stop(&mut self) -> Result<()> {
        self.worker.begin_stop()?;
        info!("stopping daemon");

        self.ipsec.stop()?;

        let root = self.root.handle()?.clone();
        for name in self.order.iter().rev() {
            let Some(overlay) = self.overlays.get_mut(name) else {
                continue;
            };
            overlay
                .stop(&root)
                .inspect_err(|e| error!(overlay = %name, error = %e, "failed to stop overlay"))?;
        }

        self.root.stop()?;

        if !self.config.dry_run {
            debug!(dir = %self.config.lib_dir.display(), "removing lib dir");
            match std::fs::remove_dir_all(&self.config.lib_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.worker.finish_stop();
        info!("finished stopping daemon");
        Ok(())
    }

    /// Remove every overlay in reverse order. Terminal.
    pub fn remove(&mut self) -> Result<()> {
        self.worker.begin_remove()?;

        self.ipsec.remove()?;
        for name in self.order.iter().rev() {
            let Some(overlay) = self.overlays.get_mut(name) else {
                continue;
            };
            overlay
                .remove()
                .inspect_err(|e| error!(overlay = %name, error = %e, "failed to remove overlay"))?;
        }

        self.worker.finish_remove();
        debug!("removed daemon");
        Ok(())
    }

    /// Tear down overlays a previous process left running.
    ///
    /// A cleanly stopped daemon leaves no runtime directories behind, so
    /// every snapshot found here belongs to an overlay that was never
    /// stopped. Each is rebuilt against throwaway allocators and torn down.
    fn clear_stale(&self, root: &NamespaceHandle) -> Result<()> {
        let dir = self.config.lib_dir.join("overlays");
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        paths.sort();

        let allocators = Allocators::new();
        let mesh_links = Arc::new(MeshLinkRegistry::new());

        for path in paths {
            let snapshot = path.join(OVERLAY_SNAPSHOT);
            let stale = std::fs::read_to_string(&snapshot)
                .map_err(|e| ConfigError::Invalid(format!("{}: {e}", snapshot.display())))
                .and_then(|content| OverlayConfig::from_json(&content));

            let config = match stale {
                Ok(config) => config,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "discarding unreadable overlay state");
                    std::fs::remove_dir_all(&path)?;
                    continue;
                }
            };

            let name = config.name.clone();
            let mut overlay = Overlay::new(config, &self.config)?;
            overlay.setup(Arc::clone(&self.netlink), &allocators, &mesh_links)?;
            overlay
                .clear_stale(root)
                .inspect_err(|e| error!(overlay = %name, error = %e, "failed to clear stale overlay"))?;
        }
        Ok(())
    }
}

impl Worker for Daemon {
    fn worker(&self) -> &WorkerState {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DummyConfig, InterfaceConfig, StaticTunnelConfig, TunnelMode, VethConfig,
    };
    use crate::error::{Error, StateError};
    use crate::ipsec::NoIpsec;
    use crate::netlink::{DryRunNetlink, Netlink, Operation};
    use tempfile::TempDir;

    fn overlay(name: &str, interfaces: Vec<InterfaceConfig>) -> OverlayConfig {
        OverlayConfig {
            name: name.to_string(),
            enabled: true,
            mesh: None,
            fwbuilder_script: None,
            interfaces,
        }
    }

    fn dummy(name: &str) -> InterfaceConfig {
        InterfaceConfig::Dummy(DummyConfig {
            name: name.to_string(),
            address: "10.255.0.1".parse().expect("ip"),
            netmask: 32,
        })
    }

    struct Fixture {
        daemon: Daemon,
        netlink: Arc<DryRunNetlink>,
        _lib: TempDir,
    }

    fn daemon(overlays: Vec<OverlayConfig>) -> Fixture {
        let lib = TempDir::new().expect("tempdir");
        let netlink = Arc::new(DryRunNetlink::new());
        let config = DaemonConfig {
            dry_run: true,
            lib_dir: lib.path().to_path_buf(),
            ..DaemonConfig::default()
        };
        let daemon = Daemon::new(config, overlays, netlink.clone(), Box::new(NoIpsec))
            .expect("daemon");
        Fixture {
            daemon,
            netlink,
            _lib: lib,
        }
    }

    #[test]
    fn test_duplicate_overlay_rejected() {
        let result = Daemon::new(
            DaemonConfig::default(),
            vec![overlay("a", vec![]), overlay("a", vec![])],
            Arc::new(DryRunNetlink::new()),
            Box::new(NoIpsec),
        );
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::DuplicateOverlay(ref name))) if name == "a"
        ));
    }

    #[test]
    fn test_order_follows_dependencies() {
        let veth = InterfaceConfig::Veth(VethConfig {
            name: "to-b".to_string(),
            inner_namespace: Some("b".to_string()),
            outer_interface_bridged: false,
            inner_address: None,
            outer_address: None,
            netmask: None,
        });
        let fx = daemon(vec![overlay("a", vec![veth]), overlay("b", vec![])]);
        assert_eq!(fx.daemon.order().to_vec(), vec!["b", "a"]);
    }

    #[test]
    fn test_start_before_setup_fails() {
        let Fixture {
            mut daemon, _lib, ..
        } = daemon(vec![overlay("a", vec![dummy("d")])]);
        assert!(matches!(
            daemon.start(),
            Err(Error::State(StateError::NotSetup(_)))
        ));
    }

    #[test]
    fn test_setup_twice_fails() {
        let Fixture {
            mut daemon, _lib, ..
        } = daemon(vec![]);
        daemon.setup().expect("setup");
        assert!(matches!(
            daemon.setup(),
            Err(Error::State(StateError::AlreadySetup(_)))
        ));
    }

    #[test]
    fn test_full_lifecycle() {
        let Fixture {
            mut daemon,
            netlink,
            _lib,
        } = daemon(vec![overlay("a", vec![dummy("d")])]);
        daemon.setup().expect("setup");
        daemon.start().expect("start");
        assert!(daemon.is_started());
        assert!(daemon.ipsec().is_started());
        assert_eq!(netlink.links(Some("a")), vec!["d0".to_string()]);

        assert!(matches!(
            daemon.start(),
            Err(Error::State(StateError::AlreadyStarted(_)))
        ));

        daemon.stop().expect("stop");
        assert!(netlink.links(Some("a")).is_empty());
        assert!(matches!(
            daemon.stop(),
            Err(Error::State(StateError::AlreadyStopped(_)))
        ));

        daemon.remove().expect("remove");
        assert!(daemon.is_removed());
        assert!(!netlink.namespaces().contains("a"));
    }

    #[test]
    fn test_setup_rejects_invalid_overlay_built_in_code() {
        let tunnel = InterfaceConfig::StaticTunnel(StaticTunnelConfig {
            name: "t".to_string(),
            mode: TunnelMode::Gre,
            local: "192.0.2.1".parse().expect("ip"),
            remote: "192.0.2.2".parse().expect("ip"),
            address: "10.0.0.1".parse().expect("ip"),
            netmask: 30,
            key: None,
            ikey: Some(1),
            okey: None,
        });
        let Fixture {
            mut daemon,
            netlink,
            _lib,
        } = daemon(vec![overlay("a", vec![tunnel])]);

        assert!(matches!(
            daemon.setup(),
            Err(Error::Config(ConfigError::IncompleteKeyPair { ref name, .. })) if name == "t"
        ));
        assert!(!daemon.is_setup());
        assert!(netlink.operations().is_empty());
    }

    #[test]
    fn test_setup_rejects_mixed_family_veth_built_in_code() {
        let veth = InterfaceConfig::Veth(VethConfig {
            name: "v".to_string(),
            inner_namespace: None,
            outer_interface_bridged: false,
            inner_address: Some("10.0.0.2".parse().expect("ip")),
            outer_address: Some("2001:db8::1".parse().expect("ip")),
            netmask: Some(24),
        });
        let Fixture {
            mut daemon,
            netlink,
            _lib,
        } = daemon(vec![overlay("a", vec![veth])]);

        assert!(matches!(daemon.setup(), Err(Error::Config(_))));
        assert!(netlink.operations().is_empty());
    }

    #[test]
    fn test_dry_run_leaves_stale_state_alone() {
        let Fixture {
            mut daemon,
            netlink,
            _lib,
        } = daemon(vec![overlay("a", vec![dummy("d")])]);

        let stale_dir = daemon.config().lib_dir.join("overlays").join("old");
        std::fs::create_dir_all(&stale_dir).expect("stale dir");
        std::fs::write(
            stale_dir.join(OVERLAY_SNAPSHOT),
            overlay("old", vec![]).to_json().expect("json"),
        )
        .expect("snapshot");
        netlink.namespace_create("old").expect("namespace");

        daemon.setup().expect("setup");
        daemon.start().expect("start");

        assert!(netlink.namespaces().contains("old"));
        assert!(
            !netlink
                .operations()
                .iter()
                .any(|op| matches!(op, Operation::NamespaceRemove(_)))
        );
        assert!(stale_dir.join(OVERLAY_SNAPSHOT).exists());
    }

    #[test]
    fn test_remove_before_stop_fails() {
        let Fixture {
            mut daemon, _lib, ..
        } = daemon(vec![overlay("a", vec![dummy("d")])]);
        daemon.setup().expect("setup");
        daemon.start().expect("start");
        assert!(matches!(
            daemon.remove(),
            Err(Error::State(StateError::NotStopped(_)))
        ));
    }
}
