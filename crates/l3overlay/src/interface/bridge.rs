//! Bridge helper used by the composite variants.

use tracing::debug;

use crate::netlink::{Link, LinkParams, LinkSpec, NetlinkResult};
use crate::netns::NamespaceHandle;

/// A bridge device in one namespace.
#[derive(Debug, Clone)]
pub struct Bridge {
    link: Link,
}

impl Bridge {
    /// Get or create the bridge.
    pub fn ensure(handle: &NamespaceHandle, name: &str) -> NetlinkResult<Self> {
        let link = handle
            .ensure(&LinkSpec::new(name, LinkParams::Bridge))?
            .into_link();
        Ok(Self { link })
    }

    /// The bridge device.
    #[must_use]
    pub const fn link(&self) -> &Link {
        &self.link
    }

    /// Attach a port. Attaching a port twice is a no-op.
    pub fn add_port(&self, handle: &NamespaceHandle, port: &Link) -> NetlinkResult<()> {
        if handle.master(port)?.as_deref() == Some(self.link.name.as_str()) {
            debug!(bridge = %self.link.name, port = %port.name, "port already attached");
            return Ok(());
        }
        debug!(bridge = %self.link.name, port = %port.name, "adding bridge port");
        handle.set_master(port, &self.link)?;
        handle.commit()
    }
}
