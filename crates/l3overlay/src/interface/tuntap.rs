//! tun/tap devices handed to userspace programs inside the overlay.

use crate::allocator::IFNAME_LIMIT;
use crate::config::TuntapConfig;
use crate::error::Result;
use crate::netlink::{LinkParams, LinkSpec};

use super::{bound, Env, InterfaceOps, SetupContext};

/// A persistent tun or tap device in the overlay namespace.
#[derive(Debug)]
pub struct Tuntap {
    config: TuntapConfig,
    device_name: Option<String>,
}

impl Tuntap {
    /// A tun/tap device from configuration.
    #[must_use]
    pub const fn new(config: TuntapConfig) -> Self {
        Self {
            config,
            device_name: None,
        }
    }

    /// Kernel name of the device, once set up.
    #[must_use]
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

impl InterfaceOps for Tuntap {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_ipv6(&self) -> bool {
        self.config.address.is_ipv6()
    }

    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        self.device_name = Some(ctx.interface_name(&self.config.name, None, IFNAME_LIMIT)?);
        Ok(())
    }

    fn start(&mut self, env: &Env<'_>) -> Result<()> {
        let name = bound(self.device_name.as_ref(), &self.config.name)?;
        let spec = LinkSpec::new(
            name,
            LinkParams::Tuntap {
                mode: self.config.mode,
                uid: self.config.uid,
                gid: self.config.gid,
            },
        );

        let device = env.overlay.ensure(&spec)?.into_link();
        env.overlay
            .add_ip(&device, self.config.address, self.config.netmask)?;
        env.overlay.set_up(&device)?;
        env.overlay.commit()?;
        Ok(())
    }

    fn stop(&mut self, env: &Env<'_>) -> Result<()> {
        let name = bound(self.device_name.as_ref(), &self.config.name)?;
        env.overlay.delete(name)?;
        Ok(())
    }
}
