//! Point-to-point links between two overlays.

use crate::allocator::IFNAME_LIMIT;
use crate::config::OverlayLinkConfig;
use crate::error::Result;
use crate::netlink::{LinkParams, LinkSpec};
use crate::netns::NetworkNamespace;

use super::{bound, Bridge, Env, InterfaceOps, SetupContext};

const BASE_NAME_LIMIT: usize = 13;

#[derive(Debug, Clone)]
struct Names {
    dummy: String,
    bridge: String,
    outer: String,
    inner: String,
}

/// A fully addressed veth pair from this overlay into another one.
///
/// The outer end stays in this overlay, bridged with a dummy device that
/// keeps the bridge (and its address) up regardless of the peer. The inner
/// end is moved into the inner overlay's namespace, which therefore has to
/// exist before this overlay starts.
#[derive(Debug)]
pub struct OverlayLink {
    config: OverlayLinkConfig,
    names: Option<Names>,
}

impl OverlayLink {
    /// An overlay link from configuration.
    #[must_use]
    pub const fn new(config: OverlayLinkConfig) -> Self {
        Self {
            config,
            names: None,
        }
    }

    /// The overlay the inner end is moved into.
    #[must_use]
    pub fn inner_overlay(&self) -> &str {
        &self.config.inner_overlay
    }
}

impl InterfaceOps for OverlayLink {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_ipv6(&self) -> bool {
        self.config.outer_address.is_ipv6()
    }

    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        let dummy = ctx.interface_name(&self.config.name, None, BASE_NAME_LIMIT)?;
        let bridge = ctx.interface_name(&dummy, Some("br"), IFNAME_LIMIT)?;
        let outer = ctx.interface_name(&dummy, Some("v"), IFNAME_LIMIT)?;
        let inner = ctx.interface_name(&dummy, Some("v"), IFNAME_LIMIT)?;
        self.names = Some(Names {
            dummy,
            bridge,
            outer,
            inner,
        });
        Ok(())
    }

    fn start(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.config.name)?;

        let mut inner_netns =
            NetworkNamespace::named(&self.config.inner_overlay, env.root.netlink().clone());
        inner_netns.start()?;
        let inner_handle = inner_netns.handle()?;

        let outer = env
            .overlay
            .ensure(&LinkSpec::new(
                &names.outer,
                LinkParams::Veth {
                    peer: names.inner.clone(),
                },
            ))?
            .into_link();
        let inner = env.overlay.get(&names.inner)?;
        let inner = env.overlay.move_to(&inner, inner_handle)?;

        let dummy = env
            .overlay
            .ensure(&LinkSpec::new(&names.dummy, LinkParams::Dummy))?
            .into_link();
        let bridge = Bridge::ensure(env.overlay, &names.bridge)?;
        bridge.add_port(env.overlay, &outer)?;
        bridge.add_port(env.overlay, &dummy)?;

        env.overlay
            .add_ip(bridge.link(), self.config.outer_address, self.config.netmask)?;
        inner_handle.add_ip(&inner, self.config.inner_address, self.config.netmask)?;

        env.overlay.set_up(&outer)?;
        inner_handle.set_up(&inner)?;
        env.overlay.set_up(&dummy)?;
        env.overlay.set_up(bridge.link())?;

        env.overlay.commit()?;
        inner_handle.commit()?;
        inner_netns.stop()?;
        Ok(())
    }

    fn stop(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.config.name)?;
        env.overlay.delete(&names.bridge)?;
        env.overlay.delete(&names.dummy)?;
        env.overlay.delete(&names.outer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::testing::Host;
    use crate::netlink::Netlink;

    fn config() -> OverlayLinkConfig {
        OverlayLinkConfig {
            name: "to-core".to_string(),
            inner_overlay: "core".to_string(),
            outer_address: "10.2.0.1".parse().expect("ip"),
            inner_address: "10.2.0.2".parse().expect("ip"),
            netmask: 30,
        }
    }

    #[test]
    fn test_links_two_overlays() {
        let host = Host::new("edge");
        host.netlink.namespace_create("core").expect("ns");
        let mut link = OverlayLink::new(config());
        link.setup(&host.ctx).expect("setup");
        link.start(&host.env()).expect("start");

        assert_eq!(host.netlink.links(Some("core")), vec!["tocore0v1".to_string()]);
        assert_eq!(
            host.netlink.addresses(Some("core"), "tocore0v1"),
            vec![("10.2.0.2".parse().expect("ip"), 30)]
        );
        assert_eq!(
            host.netlink.addresses(Some("edge"), "tocore0br0"),
            vec![("10.2.0.1".parse().expect("ip"), 30)]
        );
        assert!(host.netlink.is_up(Some("core"), "tocore0v1"));

        link.stop(&host.env()).expect("stop");
        assert!(host.netlink.links(Some("edge")).is_empty());
        assert!(host.netlink.links(Some("core")).is_empty());
    }

    #[test]
    fn test_is_ipv6() {
        let mut c = config();
        assert!(!OverlayLink::new(c.clone()).is_ipv6());
        c.outer_address = "2001:db8::1".parse().expect("ip");
        assert!(OverlayLink::new(c).is_ipv6());
    }
}
