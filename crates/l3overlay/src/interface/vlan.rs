//! 802.1Q VLANs bridged into an overlay.

use crate::allocator::IFNAME_LIMIT;
use crate::config::VlanConfig;
use crate::error::Result;
use crate::netlink::{LinkParams, LinkSpec};

use super::{bound, Bridge, Env, InterfaceOps, SetupContext};

const BASE_NAME_LIMIT: usize = 12;

#[derive(Debug, Clone)]
struct Names {
    vlan: String,
    root_veth: String,
    netns_veth: String,
    bridge: String,
}

/// A VLAN on a physical interface in the root namespace, bridged to a veth
/// pair whose other end carries the VLAN's address inside the overlay.
#[derive(Debug)]
pub struct Vlan {
    config: VlanConfig,
    names: Option<Names>,
}

impl Vlan {
    /// A VLAN from configuration.
    #[must_use]
    pub const fn new(config: VlanConfig) -> Self {
        Self {
            config,
            names: None,
        }
    }
}

impl InterfaceOps for Vlan {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_ipv6(&self) -> bool {
        self.config.address.is_ipv6()
    }

    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        let vlan = ctx.interface_name(&self.config.name, Some("vl"), BASE_NAME_LIMIT)?;
        let root_veth = ctx.interface_name(&vlan, Some("v"), IFNAME_LIMIT)?;
        let netns_veth = ctx.interface_name(&vlan, Some("v"), IFNAME_LIMIT)?;
        let bridge = ctx.interface_name(&vlan, Some("br"), IFNAME_LIMIT)?;
        self.names = Some(Names {
            vlan,
            root_veth,
            netns_veth,
            bridge,
        });
        Ok(())
    }

    fn start(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.config.name)?;

        let physical = env.root.get(&self.config.physical_interface)?;
        let vlan = env
            .root
            .ensure(&LinkSpec::new(
                &names.vlan,
                LinkParams::Vlan {
                    parent: physical.name.clone(),
                    id: self.config.id,
                },
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
        env.overlay
            .add_ip(&netns_veth, self.config.address, self.config.netmask)?;

        let bridge = Bridge::ensure(env.root, &names.bridge)?;
        bridge.add_port(env.root, &vlan)?;
        bridge.add_port(env.root, &root_veth)?;

        env.root.set_up(&physical)?;
        env.root.set_up(&vlan)?;
        env.root.set_up(&root_veth)?;
        env.overlay.set_up(&netns_veth)?;
        env.root.set_up(bridge.link())?;

        env.root.commit()?;
        env.overlay.commit()?;
        Ok(())
    }

    fn stop(&mut self, env: &Env<'_>) -> Result<()> {
        let names = bound(self.names.as_ref(), &self.config.name)?;
        env.root.delete(&names.bridge)?;
        env.root.delete(&names.root_veth)?;
        env.root.delete(&names.vlan)?;
        Ok(())
    }
}
