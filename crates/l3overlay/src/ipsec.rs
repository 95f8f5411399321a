//! IPsec supervision for mesh links.
//!
//! Mesh tunnels register the physical address pairs they run over in a
//! [`MeshLinkRegistry`]. Once every overlay has started, the daemon's
//! [`IpsecProcess`] hands the registered links to an [`IpsecControl`]
//! implementation, which is responsible for the actual IPsec daemon.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::{ResourceError, Result};
use crate::worker::{Worker, WorkerState};

/// A physical (local, remote) pair carrying mesh traffic.
pub type MeshLink = (IpAddr, IpAddr);

/// Reference-counted set of mesh links.
#[derive(Debug, Default)]
pub struct MeshLinkRegistry {
    links: RwLock<BTreeMap<MeshLink, usize>>,
}

impl MeshLinkRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more user of the link.
    pub fn add(&self, local: IpAddr, remote: IpAddr) {
        let mut links = self.links.write();
        let count = links.entry((local, remote)).or_insert(0);
        *count += 1;
        debug!(%local, %remote, users = *count, "mesh link added");
    }

    /// Drop one user of the link, forgetting it when none remain.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::MeshLinkNotFound`] if the link is not
    /// registered.
    pub fn remove(&self, local: IpAddr, remote: IpAddr) -> std::result::Result<(), ResourceError> {
        let mut links = self.links.write();
        let Some(count) = links.get_mut(&(local, remote)) else {
            return Err(ResourceError::MeshLinkNotFound { local, remote });
        };
        *count -= 1;
        if *count == 0 {
            links.remove(&(local, remote));
        }
        debug!(%local, %remote, "mesh link removed");
        Ok(())
    }

    /// Number of users of a link.
    #[must_use]
    pub fn count(&self, local: IpAddr, remote: IpAddr) -> usize {
        self.links.read().get(&(local, remote)).copied().unwrap_or(0)
    }

    /// Registered links, sorted.
    #[must_use]
    pub fn links(&self) -> Vec<MeshLink> {
        self.links.read().keys().copied().collect()
    }
}

/// Control over the IPsec daemon protecting mesh links.
pub trait IpsecControl: Send + Sync + fmt::Debug {
    /// Bring up protection for the given links.
    fn apply(&self, links: &[MeshLink]) -> std::result::Result<(), ResourceError>;

    /// Withdraw protection for the given links.
    fn withdraw(&self, links: &[MeshLink]) -> std::result::Result<(), ResourceError>;
}

/// IPsec disabled: links are left unprotected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIpsec;

impl IpsecControl for NoIpsec {
    fn apply(&self, links: &[MeshLink]) -> std::result::Result<(), ResourceError> {
        debug!(links = links.len(), "ipsec disabled, not protecting mesh links");
        Ok(())
    }

    fn withdraw(&self, _links: &[MeshLink]) -> std::result::Result<(), ResourceError> {
        Ok(())
    }
}

/// Worker driving an [`IpsecControl`] with the current mesh links.
#[derive(Debug)]
pub struct IpsecProcess {
    control: Box<dyn IpsecControl>,
    worker: WorkerState,
    applied: Vec<MeshLink>,
}

impl IpsecProcess {
    /// Wrap a control implementation.
    #[must_use]
    pub fn new(control: Box<dyn IpsecControl>) -> Self {
        Self {
            control,
            worker: WorkerState::new("ipsec process"),
            applied: Vec::new(),
        }
    }

    /// Apply protection for every registered link.
    pub fn start(&mut self, registry: &MeshLinkRegistry) -> Result<()> {
        self.worker.begin_start()?;
        let links = registry.links();
        info!(links = links.len(), "starting ipsec process");
        self.control.apply(&links)?;
        self.applied = links;
        self.worker.finish_start();
        Ok(())
    }

    /// Withdraw protection for the links applied at start.
    pub fn stop(&mut self) -> Result<()> {
        self.worker.begin_stop()?;
        info!(links = self.applied.len(), "stopping ipsec process");
        self.control.withdraw(&self.applied)?;
        self.applied.clear();
        self.worker.finish_stop();
        Ok(())
    }

    /// Mark the process removed.
    pub fn remove(&mut self) -> Result<()> {
        self.worker.begin_remove()?;
        self.worker.finish_remove();
        Ok(())
    }

    /// Links protected by the last start.
    #[must_use]
    pub fn applied(&self) -> &[MeshLink] {
        &self.applied
    }
}

impl Worker for IpsecProcess {
    fn worker(&self) -> &WorkerState {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, StateError};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("valid ip")
    }

    #[derive(Debug, Default)]
    struct FakeIpsec {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl IpsecControl for FakeIpsec {
        fn apply(&self, links: &[MeshLink]) -> std::result::Result<(), ResourceError> {
            self.calls.lock().push(format!("apply {}", links.len()));
            Ok(())
        }

        fn withdraw(&self, links: &[MeshLink]) -> std::result::Result<(), ResourceError> {
            self.calls.lock().push(format!("withdraw {}", links.len()));
            Ok(())
        }
    }

    #[test]
    fn test_registry_refcounts() {
        let registry = MeshLinkRegistry::new();
        registry.add(ip("192.0.2.1"), ip("192.0.2.2"));
        registry.add(ip("192.0.2.1"), ip("192.0.2.2"));
        assert_eq!(registry.count(ip("192.0.2.1"), ip("192.0.2.2")), 2);

        registry.remove(ip("192.0.2.1"), ip("192.0.2.2")).expect("remove");
        assert_eq!(registry.links().len(), 1);
        registry.remove(ip("192.0.2.1"), ip("192.0.2.2")).expect("remove");
        assert!(registry.links().is_empty());
    }

    #[test]
    fn test_registry_remove_unknown_fails() {
        let registry = MeshLinkRegistry::new();
        assert!(matches!(
            registry.remove(ip("192.0.2.1"), ip("192.0.2.2")),
            Err(ResourceError::MeshLinkNotFound { .. })
        ));
    }

    #[test]
    fn test_process_applies_registered_links() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut process = IpsecProcess::new(Box::new(FakeIpsec {
            calls: Arc::clone(&calls),
        }));
        let registry = MeshLinkRegistry::new();
        registry.add(ip("192.0.2.1"), ip("192.0.2.2"));
        registry.add(ip("192.0.2.1"), ip("192.0.2.3"));

        process.start(&registry).expect("start");
        assert_eq!(process.applied().len(), 2);
        process.stop().expect("stop");
        process.remove().expect("remove");

        assert_eq!(*calls.lock(), vec!["apply 2", "withdraw 2"]);
    }

    #[test]
    fn test_process_stop_before_start_fails() {
        let mut process = IpsecProcess::new(Box::new(NoIpsec));
        assert!(matches!(
            process.stop(),
            Err(Error::State(StateError::AlreadyStopped(_)))
        ));
    }
}
