//! Dummy devices, usually carrying a loopback-style address.

use crate::allocator::IFNAME_LIMIT;
use crate::config::DummyConfig;
use crate::error::Result;
use crate::netlink::{LinkParams, LinkSpec};

use super::{bound, Env, InterfaceOps, SetupContext};

/// A dummy device in the overlay namespace.
#[derive(Debug)]
pub struct Dummy {
    config: DummyConfig,
    device_name: Option<String>,
}

impl Dummy {
    /// A dummy device from configuration.
    #[must_use]
    pub const fn new(config: DummyConfig) -> Self {
        Self {
            config,
            device_name: None,
        }
    }
}

impl InterfaceOps for Dummy {
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
        let device = env
            .overlay
            .ensure(&LinkSpec::new(name, LinkParams::Dummy))?
            .into_link();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::testing::Host;

    #[test]
    fn test_restart_after_stop() {
        let host = Host::new("ov1");
        let config = DummyConfig {
            name: "lo-1".to_string(),
            address: "10.255.0.1".parse().expect("ip"),
            netmask: 32,
        };
        let mut dummy = Dummy::new(config);
        dummy.setup(&host.ctx).expect("setup");
        dummy.start(&host.env()).expect("start");
        dummy.stop(&host.env()).expect("stop");
        dummy.start(&host.env()).expect("restart");

        assert_eq!(host.netlink.links(Some("ov1")), vec!["lo10".to_string()]);
        assert_eq!(
            host.netlink.addresses(Some("ov1"), "lo10"),
            vec![("10.255.0.1".parse().expect("ip"), 32)]
        );
    }
}
