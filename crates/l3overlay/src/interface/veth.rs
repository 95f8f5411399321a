//! veth pairs reaching into the overlay from another namespace.

use std::net::IpAddr;

use crate::allocator::IFNAME_LIMIT;
use crate::config::VethConfig;
use crate::error::Result;
use crate::netlink::{Link, LinkParams, LinkSpec};
use crate::netns::{NamespaceHandle, NetworkNamespace};

use super::{bound, Bridge, Env, InterfaceOps, SetupContext};

/// Base name limit, leaving room for the derived suffixes.
const BASE_NAME_LIMIT: usize = 12;

#[derive(Debug, Clone)]
struct Names {
    dummy: String,
    bridge: String,
    inner: String,
    outer: String,
}

/// A veth pair whose inner end lives in a named namespace (or root) and
/// whose outer end lives in the overlay.
///
/// When the inner namespace belongs to another overlay, that overlay must
/// be started first; this is one of the edges the dependency resolver
/// follows.
#[derive(Debug)]
pub struct Veth {
    config: VethConfig,
    names: Option<Names>,
}

impl Veth {
    /// A veth from configuration.
    #[must_use]
    pub const fn new(config: VethConfig) -> Self {
        Self {
            config,
            names: None,
        }
    }

    /// Namespace of the inner end, `None` for root.
    #[must_use]
    pub fn inner_namespace(&self) -> Option<&str> {
        self.config.inner_namespace.as_deref()
    }

    fn netmask(&self, address: IpAddr) -> u8 {
        self.config
            .netmask
            .unwrap_or(if address.is_ipv6() { 128 } else { 32 })
    }

    fn add_address(
        &self,
        handle: &NamespaceHandle,
        link: &Link,
        address: Option<IpAddr>,
    ) -> Result<()> {
        if let Some(address) = address {
            handle.add_ip(link, address, self.netmask(address))?;
        }
        Ok(())
    }
}

impl InterfaceOps for Veth {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Follows the outer address, then the inner one; unaddressed veths
    /// count as IPv4.
    fn is_ipv6(&self) -> bool {
        self.config
            .outer_address
            .or(self.config.inner_address)
            .is_some_and(|a| a.is_ipv6())
    }

    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        let dummy = ctx.interface_name(&self.config.name, None, BASE_NAME_LIMIT)?;
        let bridge = ctx.interface_name(&dummy, Some("br"), IFNAME_LIMIT)?;
        let inner = ctx.interface_name(&dummy, Some("v"), IFNAME_LIMIT)?;
        let outer = ctx.interface_name(&dummy, Some("v"), IFNAME_LIMIT)?;
        self.names = Some(Names {
            dummy,
            bridge,
            inner,
            outer,
        });
        Ok(())
    }

    fn start(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.config.name)?;

        let mut inner_netns =
            NetworkNamespace::new(self.inner_namespace(), env.root.netlink().clone());
        inner_netns.start()?;
        let inner_handle = inner_netns.handle()?;

        let inner = inner_handle
            .ensure(&LinkSpec::new(
                &names.inner,
                LinkParams::Veth {
                    peer: names.outer.clone(),
                },
            ))?
            .into_link();
        let outer = inner_handle.get(&names.outer)?;
        let outer = inner_handle.move_to(&outer, env.overlay)?;

        let bridged = if self.config.outer_interface_bridged {
            let dummy = env
                .overlay
                .ensure(&LinkSpec::new(&names.dummy, LinkParams::Dummy))?
                .into_link();
            let bridge = Bridge::ensure(env.overlay, &names.bridge)?;
            bridge.add_port(env.overlay, &outer)?;
            bridge.add_port(env.overlay, &dummy)?;
            Some((dummy, bridge))
        } else {
            None
        };

        self.add_address(inner_handle, &inner, self.config.inner_address)?;
        let outer_address_link = bridged.as_ref().map_or(&outer, |(_, b)| b.link());
        self.add_address(env.overlay, outer_address_link, self.config.outer_address)?;

        env.overlay.set_up(&outer)?;
        inner_handle.set_up(&inner)?;
        if let Some((dummy, bridge)) = &bridged {
            env.overlay.set_up(dummy)?;
            env.overlay.set_up(bridge.link())?;
        }

        inner_handle.commit()?;
        env.overlay.commit()?;
        inner_netns.stop()?;
        Ok(())
    }

    /// Deleting the outer end takes the inner end with it, so the inner
    /// namespace is never touched.
    fn stop(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.config.name)?;
        if self.config.outer_interface_bridged {
            env.overlay.delete(&names.bridge)?;
            env.overlay.delete(&names.dummy)?;
        }
        env.overlay.delete(&names.outer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::testing::Host;
    use crate::netlink::Netlink;

    fn config(inner_namespace: Option<&str>, bridged: bool) -> VethConfig {
        VethConfig {
            name: "link-a".to_string(),
            inner_namespace: inner_namespace.map(str::to_string),
            outer_interface_bridged: bridged,
            inner_address: Some("10.1.0.2".parse().expect("ip")),
            outer_address: if bridged {
                Some("10.1.0.1".parse().expect("ip"))
            } else {
                None
            },
            netmask: Some(24),
        }
    }

    #[test]
    fn test_names_derive_from_dummy() {
        let host = Host::new("ov1");
        let mut veth = Veth::new(config(None, false));
        veth.setup(&host.ctx).expect("setup");
        let names = veth.names.as_ref().expect("names");
        assert_eq!(names.dummy, "linka0");
        assert_eq!(names.bridge, "linka0br0");
        assert_eq!(names.inner, "linka0v0");
        assert_eq!(names.outer, "linka0v1");
    }

    #[test]
    fn test_unbridged_from_root() {
        let host = Host::new("ov1");
        let mut veth = Veth::new(config(None, false));
        veth.setup(&host.ctx).expect("setup");
        veth.start(&host.env()).expect("start");

        assert_eq!(host.netlink.links(None), vec!["linka0v0".to_string()]);
        assert_eq!(host.netlink.links(Some("ov1")), vec!["linka0v1".to_string()]);
        assert_eq!(
            host.netlink.addresses(None, "linka0v0"),
            vec![("10.1.0.2".parse().expect("ip"), 24)]
        );
        assert!(host.netlink.is_up(Some("ov1"), "linka0v1"));

        veth.stop(&host.env()).expect("stop");
        assert!(host.netlink.links(None).is_empty());
        assert!(host.netlink.links(Some("ov1")).is_empty());
    }

    #[test]
    fn test_bridged_into_other_namespace() {
        let host = Host::new("ov1");
        host.netlink.namespace_create("ov2").expect("ns");
        let mut veth = Veth::new(config(Some("ov2"), true));
        veth.setup(&host.ctx).expect("setup");
        veth.start(&host.env()).expect("start");

        assert_eq!(host.netlink.links(Some("ov2")), vec!["linka0v0".to_string()]);
        let mut overlay_links = host.netlink.links(Some("ov1"));
        overlay_links.sort();
        assert_eq!(overlay_links, vec!["linka0", "linka0br0", "linka0v1"]);
        assert_eq!(
            host.netlink.addresses(Some("ov1"), "linka0br0"),
            vec![("10.1.0.1".parse().expect("ip"), 24)]
        );

        veth.stop(&host.env()).expect("stop");
        assert!(host.netlink.links(Some("ov1")).is_empty());
        assert!(host.netlink.links(Some("ov2")).is_empty());
        // The inner namespace belongs to someone else and is left alone.
        assert!(host.netlink.namespaces().contains("ov2"));
    }

    #[test]
    fn test_is_ipv6_follows_addresses() {
        let mut c = config(None, false);
        assert!(!Veth::new(c.clone()).is_ipv6());
        c.inner_address = Some("2001:db8::2".parse().expect("ip"));
        assert!(Veth::new(c.clone()).is_ipv6());
        c.inner_address = None;
        assert!(!Veth::new(c).is_ipv6());
    }
}
