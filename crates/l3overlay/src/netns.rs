//! Network namespace lifecycle.
//!
//! A [`NetworkNamespace`] owns the lifetime of a named namespace (or stands
//! for the root namespace). While started it hands out a
//! [`NamespaceHandle`], through which every device operation inside the
//! namespace is made.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ResourceError, Result, StateError};
use crate::netlink::{Link, LinkSpec, Netlink, NetlinkResult, Process};
use crate::worker::{Worker, WorkerState};

/// Outcome of [`NamespaceHandle::ensure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured {
    /// The device was created.
    Created(Link),
    /// A compatible device already existed and was reused.
    Existing(Link),
}

impl Ensured {
    /// The device.
    #[must_use]
    pub const fn link(&self) -> &Link {
        match self {
            Self::Created(link) | Self::Existing(link) => link,
        }
    }

    /// Take the device.
    #[must_use]
    pub fn into_link(self) -> Link {
        match self {
            Self::Created(link) | Self::Existing(link) => link,
        }
    }

    /// Whether the device was newly created.
    #[must_use]
    pub const fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Device operations scoped to one namespace.
#[derive(Debug, Clone)]
pub struct NamespaceHandle {
    netns: Option<String>,
    netlink: Arc<dyn Netlink>,
}

impl NamespaceHandle {
    /// The namespace name (`None` for root).
    #[must_use]
    pub fn netns(&self) -> Option<&str> {
        self.netns.as_deref()
    }

    /// The backend this handle drives.
    #[must_use]
    pub fn netlink(&self) -> &Arc<dyn Netlink> {
        &self.netlink
    }

    /// Look up a device by name.
    pub fn get(&self, name: &str) -> NetlinkResult<Link> {
        self.netlink.get(self.netns(), name)
    }

    /// Create a device, failing if the name is taken.
    pub fn create(&self, spec: &LinkSpec) -> NetlinkResult<Link> {
        self.netlink.create(self.netns(), spec)
    }

    /// Get or create a device.
    ///
    /// An existing device is reused only if it has the same kind and the
    /// spec carries no parameters that could differ (bridges, dummies). Any
    /// other existing device of that name is deleted and recreated.
    pub fn ensure(&self, spec: &LinkSpec) -> NetlinkResult<Ensured> {
        match self.get(&spec.name) {
            Ok(existing) if existing.kind == spec.kind() && spec.is_reusable() => {
                debug!(netns = ?self.netns, interface = %spec.name, "reusing existing device");
                Ok(Ensured::Existing(existing))
            }
            Ok(stale) => {
                info!(
                    netns = ?self.netns,
                    interface = %spec.name,
                    kind = %stale.kind,
                    "replacing stale device"
                );
                self.netlink.remove(&stale)?;
                Ok(Ensured::Created(self.create(spec)?))
            }
            Err(e) if e.is_not_found() => Ok(Ensured::Created(self.create(spec)?)),
            Err(e) => Err(e),
        }
    }

    /// Add an address to a device in this namespace.
    pub fn add_ip(&self, link: &Link, address: IpAddr, prefix_len: u8) -> NetlinkResult<()> {
        self.netlink.add_ip(link, address, prefix_len)
    }

    /// Set a device up.
    pub fn set_up(&self, link: &Link) -> NetlinkResult<()> {
        self.netlink.set_up(link)
    }

    /// Move a device into the namespace of `target`.
    pub fn move_to(&self, link: &Link, target: &Self) -> NetlinkResult<Link> {
        self.netlink.set_namespace(link, target.netns())
    }

    /// Attach a device to a bridge.
    pub fn set_master(&self, link: &Link, bridge: &Link) -> NetlinkResult<()> {
        self.netlink.set_master(link, bridge)
    }

    /// The bridge a device is attached to.
    pub fn master(&self, link: &Link) -> NetlinkResult<Option<String>> {
        self.netlink.master(link)
    }

    /// Delete a device.
    pub fn remove(&self, link: &Link) -> NetlinkResult<()> {
        self.netlink.remove(link)
    }

    /// Delete a device by name if it still exists.
    ///
    /// Returns whether a device was deleted. Devices can disappear on
    /// their own, e.g. when the other end of a veth pair is deleted.
    pub fn delete(&self, name: &str) -> NetlinkResult<bool> {
        match self.get(name) {
            Ok(link) => {
                self.netlink.remove(&link)?;
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(netns = ?self.netns, interface = %name, "device already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Flush pending changes.
    pub fn commit(&self) -> NetlinkResult<()> {
        self.netlink.commit(self.netns())
    }
}

/// A network namespace with a lifecycle.
#[derive(Debug)]
pub struct NetworkNamespace {
    name: Option<String>,
    netlink: Arc<dyn Netlink>,
    worker: WorkerState,
    handle: Option<NamespaceHandle>,
}

impl NetworkNamespace {
    /// The root namespace. It is never created or deleted.
    #[must_use]
    pub fn root(netlink: Arc<dyn Netlink>) -> Self {
        Self {
            name: None,
            netlink,
            worker: WorkerState::new("root network namespace"),
            handle: None,
        }
    }

    /// A named namespace.
    #[must_use]
    pub fn named(name: impl Into<String>, netlink: Arc<dyn Netlink>) -> Self {
        let name = name.into();
        Self {
            worker: WorkerState::new(format!("network namespace '{name}'")),
            name: Some(name),
            netlink,
            handle: None,
        }
    }

    /// A named namespace, or root for `None`.
    #[must_use]
    pub fn new(name: Option<&str>, netlink: Arc<dyn Netlink>) -> Self {
        match name {
            Some(name) => Self::named(name, netlink),
            None => Self::root(netlink),
        }
    }

    /// The namespace name (`None` for root).
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Create the namespace if needed and acquire a handle.
    pub fn start(&mut self) -> Result<()> {
        self.worker.begin_start()?;

        if let Some(name) = &self.name {
            let existing: BTreeSet<String> = self.netlink.namespace_list()?;
            if existing.contains(name) {
                debug!(netns = %name, "namespace already exists");
            } else {
                info!(netns = %name, "creating network namespace");
                self.netlink.namespace_create(name)?;
            }
        }

        self.handle = Some(NamespaceHandle {
            netns: self.name.clone(),
            netlink: Arc::clone(&self.netlink),
        });

        self.worker.finish_start();
        Ok(())
    }

    /// Release the handle. The namespace itself is kept.
    pub fn stop(&mut self) -> Result<()> {
        self.worker.begin_stop()?;
        self.handle = None;
        self.worker.finish_stop();
        Ok(())
    }

    /// Delete the namespace. A no-op for root.
    pub fn remove(&mut self) -> Result<()> {
        self.worker.begin_remove()?;
        if let Some(name) = &self.name {
            match self.netlink.namespace_remove(name) {
                Ok(()) => info!(netns = %name, "removed network namespace"),
                Err(ResourceError::NotFound { .. }) => {
                    debug!(netns = %name, "namespace already removed");
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.worker.finish_remove();
        Ok(())
    }

    /// The handle, available while started.
    pub fn handle(&self) -> Result<&NamespaceHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| StateError::NotStarted(self.worker.description().to_string()).into())
    }

    /// Spawn a command inside the namespace.
    pub fn spawn(&self, argv: &[String]) -> Result<Box<dyn Process>> {
        self.worker.require_started()?;
        Ok(self.netlink.popen(self.name(), argv)?)
    }
}

impl Worker for NetworkNamespace {
    fn worker(&self) -> &WorkerState {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::netlink::{DryRunNetlink, LinkKind, LinkParams};

    fn backend() -> Arc<DryRunNetlink> {
        Arc::new(DryRunNetlink::new())
    }

    #[test]
    fn test_start_creates_namespace_once() {
        let nl = backend();
        let mut ns = NetworkNamespace::named("ov1", nl.clone());
        ns.start().expect("start");
        ns.stop().expect("stop");
        ns.start().expect("restart");
        assert!(nl.namespaces().contains("ov1"));
        let creates = nl
            .operations()
            .iter()
            .filter(|op| matches!(op, crate::netlink::Operation::NamespaceCreate(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn test_handle_before_start_fails() {
        let ns = NetworkNamespace::named("ov1", backend());
        assert!(matches!(
            ns.handle(),
            Err(Error::State(StateError::NotStarted(_)))
        ));
        assert!(matches!(
            ns.spawn(&["true".to_string()]),
            Err(Error::State(StateError::NotStarted(_)))
        ));
    }

    #[test]
    fn test_stop_releases_handle() {
        let mut ns = NetworkNamespace::named("ov1", backend());
        ns.start().expect("start");
        assert!(ns.handle().is_ok());
        ns.stop().expect("stop");
        assert!(ns.handle().is_err());
    }

    #[test]
    fn test_remove_deletes_namespace() {
        let nl = backend();
        let mut ns = NetworkNamespace::named("ov1", nl.clone());
        ns.start().expect("start");
        ns.stop().expect("stop");
        ns.remove().expect("remove");
        assert!(ns.is_removed());
        assert!(!nl.namespaces().contains("ov1"));
    }

    #[test]
    fn test_root_is_never_created_or_removed() {
        let nl = backend();
        let mut ns = NetworkNamespace::root(nl.clone());
        ns.start().expect("start");
        assert_eq!(ns.handle().expect("handle").netns(), None);
        ns.stop().expect("stop");
        ns.remove().expect("remove");
        assert!(nl.operations().is_empty());
    }

    #[test]
    fn test_ensure_reuses_bridge_and_replaces_veth() {
        let nl = backend();
        let mut ns = NetworkNamespace::root(nl.clone());
        ns.start().expect("start");
        let handle = ns.handle().expect("handle");

        let bridge = LinkSpec::new("br0", LinkParams::Bridge);
        assert!(handle.ensure(&bridge).expect("create").is_created());
        let again = handle.ensure(&bridge).expect("reuse");
        assert!(!again.is_created());
        assert_eq!(again.link().kind, LinkKind::Bridge);

        let veth = LinkSpec::new(
            "v0",
            LinkParams::Veth {
                peer: "v1".to_string(),
            },
        );
        handle.ensure(&veth).expect("create");
        assert!(handle.ensure(&veth).expect("replace").is_created());
    }

    #[test]
    fn test_delete_tolerates_missing() {
        let nl = backend();
        let mut ns = NetworkNamespace::root(nl);
        ns.start().expect("start");
        assert!(!ns.handle().expect("handle").delete("nothing").expect("delete"));
    }
}
