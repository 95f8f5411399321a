//! Generated full-mesh tunnels.

use std::net::IpAddr;
use std::sync::Arc;

use crate::allocator::IFNAME_LIMIT;
use crate::error::Result;
use crate::ipsec::MeshLinkRegistry;
use crate::netlink::{GreParams, LinkParams, LinkSpec};

use super::{bound, Bridge, Env, InterfaceOps, SetupContext};

const TUNNEL_TTL: u8 = 16;

#[derive(Debug, Clone)]
struct Names {
    tunnel: String,
    bridge: String,
    root_veth: String,
    netns_veth: String,
}

/// A GRETAP tunnel to one mesh peer, bridged into the overlay.
///
/// The tunnel lives in the root namespace so that it can be protected by
/// IPsec on the physical addresses. A veth pair carries its traffic into
/// the overlay, where the linknet address is assigned.
#[derive(Debug)]
pub struct MeshTunnel {
    name: String,
    node_local: String,
    node_remote: String,
    physical_local: IpAddr,
    physical_remote: IpAddr,
    virtual_local: IpAddr,
    virtual_remote: IpAddr,
    names: Option<Names>,
    key: Option<u32>,
    mesh_links: Option<Arc<MeshLinkRegistry>>,
}

impl MeshTunnel {
    /// A tunnel between two mesh nodes.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        node_local: impl Into<String>,
        node_remote: impl Into<String>,
        physical_local: IpAddr,
        physical_remote: IpAddr,
        virtual_local: IpAddr,
        virtual_remote: IpAddr,
    ) -> Self {
        Self {
            name: name.into(),
            node_local: node_local.into(),
            node_remote: node_remote.into(),
            physical_local,
            physical_remote,
            virtual_local,
            virtual_remote,
            names: None,
            key: None,
            mesh_links: None,
        }
    }

    /// Names of the local and remote nodes.
    #[must_use]
    pub fn nodes(&self) -> (&str, &str) {
        (&self.node_local, &self.node_remote)
    }

    /// Physical (local, remote) endpoints.
    #[must_use]
    pub const fn physical(&self) -> (IpAddr, IpAddr) {
        (self.physical_local, self.physical_remote)
    }

    /// Linknet (local, remote) addresses.
    #[must_use]
    pub const fn virtual_addresses(&self) -> (IpAddr, IpAddr) {
        (self.virtual_local, self.virtual_remote)
    }

    /// Prefix length of the linknet: /31 for IPv4, /127 for IPv6.
    #[must_use]
    pub const fn virtual_netmask(&self) -> u8 {
        if self.virtual_local.is_ipv6() { 127 } else { 31 }
    }

    /// GRE key assigned at setup.
    #[must_use]
    pub const fn key(&self) -> Option<u32> {
        self.key
    }

    /// Kernel name of the tunnel device, once set up.
    #[must_use]
    pub fn tunnel_name(&self) -> Option<&str> {
        self.names.as_ref().map(|n| n.tunnel.as_str())
    }
}

impl InterfaceOps for MeshTunnel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ipv6(&self) -> bool {
        self.virtual_local.is_ipv6()
    }

    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        let tunnel = ctx.interface_name(&self.name, None, IFNAME_LIMIT)?;
        let bridge = ctx.interface_name(&tunnel, Some("br"), IFNAME_LIMIT)?;
        let root_veth = ctx.interface_name(&tunnel, Some("v"), IFNAME_LIMIT)?;
        let netns_veth = ctx.interface_name(&tunnel, Some("v"), IFNAME_LIMIT)?;
        self.names = Some(Names {
            tunnel,
            bridge,
            root_veth,
            netns_veth,
        });

        self.key = Some(
            ctx.allocators
                .gre_keys
                .get_or_create(self.physical_local, self.physical_remote),
        );
        ctx.mesh_links.add(self.physical_local, self.physical_remote);
        self.mesh_links = Some(Arc::clone(&ctx.mesh_links));
        Ok(())
    }

    fn start(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.name)?;
        let key = *bound(self.key.as_ref(), &self.name)?;

        let tunnel = env
            .root
            .ensure(&LinkSpec::new(
                &names.tunnel,
                LinkParams::Gre(GreParams {
                    local: self.physical_local,
                    remote: self.physical_remote,
                    ikey: Some(key),
                    okey: Some(key),
                    ttl: TUNNEL_TTL,
                    tap: true,
                }),
            ))?
            .into_link();

        let root_veth = env
            .root
            .ensure(&LinkSpec::new(
                &names.root_veth,
                LinkParams::Veth {
                    peer: names.netns_veth.clone(),
                },
            ))?
            .into_link();
        let netns_veth = env.root.get(&names.netns_veth)?;
        let netns_veth = env.root.move_to(&netns_veth, env.overlay)?;

        let bridge = Bridge::ensure(env.root, &names.bridge)?;
        bridge.add_port(env.root, &tunnel)?;
        bridge.add_port(env.root, &root_veth)?;

        env.overlay
            .add_ip(&netns_veth, self.virtual_local, self.virtual_netmask())?;

        env.root.set_up(&tunnel)?;
        env.root.set_up(&root_veth)?;
        env.overlay.set_up(&netns_veth)?;
        env.root.set_up(bridge.link())?;

        env.root.commit()?;
        env.overlay.commit()?;
        Ok(())
    }

    fn stop(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.name)?;
        env.root.delete(&names.bridge)?;
        env.root.delete(&names.root_veth)?;
        env.root.delete(&names.tunnel)?;
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        if let Some(mesh_links) = self.mesh_links.take() {
            mesh_links.remove(self.physical_local, self.physical_remote)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::testing::Host;
    use crate::netlink::{Link, LinkKind, Netlink};

    fn tunnel(virtual_local: &str, virtual_remote: &str) -> MeshTunnel {
        MeshTunnel::new(
            "m65000l0",
            "a",
            "b",
            "192.0.2.1".parse().expect("ip"),
            "192.0.2.2".parse().expect("ip"),
            virtual_local.parse().expect("ip"),
            virtual_remote.parse().expect("ip"),
        )
    }

    #[test]
    fn test_ipv4_linknet_is_slash_31() {
        let t = tunnel("198.51.100.0", "198.51.100.1");
        assert_eq!(t.virtual_netmask(), 31);
        assert!(!t.is_ipv6());
    }

    #[test]
    fn test_ipv6_linknet_is_slash_127() {
        let t = tunnel("2001:db8::", "2001:db8::1");
        assert_eq!(t.virtual_netmask(), 127);
        assert!(t.is_ipv6());
    }

    #[test]
    fn test_setup_registers_key_and_mesh_link() {
        let host = Host::new("ov1");
        let mut first = tunnel("198.51.100.0", "198.51.100.1");
        let mut second = tunnel("198.51.100.2", "198.51.100.3");
        first.setup(&host.ctx).expect("setup");
        second.setup(&host.ctx).expect("setup");

        // Same physical pair, same sequential key.
        assert_eq!(first.key(), Some(0));
        assert_eq!(second.key(), Some(0));
        let (local, remote) = first.physical();
        assert_eq!(host.ctx.mesh_links.count(local, remote), 2);

        first.remove().expect("remove");
        assert_eq!(host.ctx.mesh_links.count(local, remote), 1);
    }

    #[test]
    fn test_start_and_stop_compose_devices() {
        let host = Host::new("ov1");
        let mut t = tunnel("198.51.100.0", "198.51.100.1");
        t.setup(&host.ctx).expect("setup");
        t.start(&host.env()).expect("start");

        assert_eq!(t.tunnel_name(), Some("m65000l00"));
        let root = host.netlink.links(None);
        assert!(root.contains(&"m65000l00".to_string()));
        assert!(root.contains(&"m65000l00br0".to_string()));
        assert!(root.contains(&"m65000l00v0".to_string()));
        assert_eq!(host.netlink.links(Some("ov1")), vec!["m65000l00v1".to_string()]);
        assert_eq!(
            host.netlink.addresses(Some("ov1"), "m65000l00v1"),
            vec![("198.51.100.0".parse().expect("ip"), 31)]
        );

        let gretap = Link {
            name: "m65000l00".to_string(),
            netns: None,
            kind: LinkKind::Gretap,
        };
        assert_eq!(
            host.netlink.master(&gretap).expect("master"),
            Some("m65000l00br0".to_string())
        );

        t.stop(&host.env()).expect("stop");
        assert!(host.netlink.links(None).is_empty());
        assert!(host.netlink.links(Some("ov1")).is_empty());
    }
}
