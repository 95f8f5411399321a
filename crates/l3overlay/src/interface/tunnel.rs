//! Statically configured GRE/GRETAP tunnels.

use std::sync::Arc;

use crate::allocator::{GreKeyAllocator, IFNAME_LIMIT};
use crate::config::{StaticTunnelConfig, TunnelMode};
use crate::error::{ConfigError, Result};
use crate::netlink::{GreParams, LinkParams, LinkSpec};

use super::{bound, Env, InterfaceOps, SetupContext};

/// Outer TTL for tunnel packets.
const TUNNEL_TTL: u8 = 16;

/// A GRE or GRETAP tunnel living in the overlay namespace.
///
/// Keys cannot be generated for static tunnels because both ends must agree
/// on them, so the configured key (or its absence) is registered with the
/// daemon and must be unique per address pair.
#[derive(Debug)]
pub struct StaticTunnel {
    config: StaticTunnelConfig,
    tunnel_name: Option<String>,
    keys: Option<Arc<GreKeyAllocator>>,
}

impl StaticTunnel {
    /// A tunnel from configuration.
    #[must_use]
    pub const fn new(config: StaticTunnelConfig) -> Self {
        Self {
            config,
            tunnel_name: None,
            keys: None,
        }
    }

    /// The configuration.
    #[must_use]
    pub const fn config(&self) -> &StaticTunnelConfig {
        &self.config
    }

    /// Kernel name of the tunnel device, once set up.
    #[must_use]
    pub fn tunnel_name(&self) -> Option<&str> {
        self.tunnel_name.as_deref()
    }

    fn spec(&self, name: &str) -> LinkSpec {
        let (ikey, okey) = match self.config.key {
            Some(key) => (Some(key), Some(key)),
            None => (self.config.ikey, self.config.okey),
        };
        LinkSpec::new(
            name,
            LinkParams::Gre(GreParams {
                local: self.config.local,
                remote: self.config.remote,
                ikey,
                okey,
                ttl: TUNNEL_TTL,
                tap: self.config.mode == TunnelMode::Gretap,
            }),
        )
    }
}

impl InterfaceOps for StaticTunnel {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_ipv6(&self) -> bool {
        self.config.address.is_ipv6()
    }

    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        let local = self.config.local;
        let remote = self.config.remote;
        let key = self.config.effective_key();

        // Registration goes last so a failed setup holds no key.
        let tunnel_name = ctx.interface_name(&self.config.name, None, IFNAME_LIMIT)?;
        if !ctx.allocators.gre_keys.register(local, remote, key) {
            return Err(match key {
                None => ConfigError::NonUniqueTunnel { local, remote },
                Some(key) => ConfigError::KeyUnavailable { local, remote, key },
            }
            .into());
        }

        self.keys = Some(Arc::clone(&ctx.allocators.gre_keys));
        self.tunnel_name = Some(tunnel_name);
        Ok(())
    }

    fn start(&mut self, env: &Env<'_>) -> Result<()> {
        let name = bound(self.tunnel_name.as_ref(), &self.config.name)?;

        let tunnel = env.overlay.ensure(&self.spec(name))?.into_link();
        env.overlay
            .add_ip(&tunnel, self.config.address, self.config.netmask)?;
        env.overlay.set_up(&tunnel)?;
        env.overlay.commit()?;
        Ok(())
    }

    fn stop(&mut self, env: &Env<'_>) -> Result<()> {
        let name = bound(self.tunnel_name.as_ref(), &self.config.name)?;
        env.overlay.delete(name)?;
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        if let Some(keys) = self.keys.take() {
            keys.release(
                self.config.local,
                self.config.remote,
                self.config.effective_key(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::interface::testing::Host;
    use crate::netlink::{LinkKind, Netlink};

    fn config(name: &str, key: Option<u32>) -> StaticTunnelConfig {
        StaticTunnelConfig {
            name: name.to_string(),
            mode: TunnelMode::Gretap,
            local: "192.0.2.1".parse().expect("ip"),
            remote: "192.0.2.2".parse().expect("ip"),
            address: "10.0.0.1".parse().expect("ip"),
            netmask: 30,
            key,
            ikey: None,
            okey: None,
        }
    }

    #[test]
    fn test_two_unkeyed_tunnels_same_pair() {
        let host = Host::new("ov1");
        let mut first = StaticTunnel::new(config("t1", None));
        let mut second = StaticTunnel::new(config("t2", None));
        first.setup(&host.ctx).expect("first setup");
        assert!(matches!(
            second.setup(&host.ctx),
            Err(Error::Config(ConfigError::NonUniqueTunnel { .. }))
        ));
    }

    #[test]
    fn test_duplicate_key_same_pair() {
        let host = Host::new("ov1");
        let mut first = StaticTunnel::new(config("t1", Some(9)));
        let mut second = StaticTunnel::new(config("t2", Some(9)));
        first.setup(&host.ctx).expect("first setup");
        assert!(matches!(
            second.setup(&host.ctx),
            Err(Error::Config(ConfigError::KeyUnavailable { key: 9, .. }))
        ));
    }

    #[test]
    fn test_rejected_tunnel_holds_no_key() {
        let host = Host::new("ov1");
        let mut first = StaticTunnel::new(config("t1", Some(9)));
        let mut rejected = StaticTunnel::new(config("t2", Some(9)));
        first.setup(&host.ctx).expect("first setup");
        assert!(rejected.setup(&host.ctx).is_err());
        assert_eq!(rejected.tunnel_name(), None);

        // Removing the rejected tunnel must not free the key its rival holds.
        rejected.remove().expect("remove");
        assert!(matches!(
            StaticTunnel::new(config("t3", Some(9))).setup(&host.ctx),
            Err(Error::Config(ConfigError::KeyUnavailable { key: 9, .. }))
        ));

        first.remove().expect("remove");
        StaticTunnel::new(config("t4", Some(9)))
            .setup(&host.ctx)
            .expect("key free again");
    }

    #[test]
    fn test_distinct_keys_same_pair() {
        let host = Host::new("ov1");
        StaticTunnel::new(config("t1", Some(1)))
            .setup(&host.ctx)
            .expect("first setup");
        StaticTunnel::new(config("t2", Some(2)))
            .setup(&host.ctx)
            .expect("second setup");
    }

    #[test]
    fn test_ikey_registers_as_key() {
        let host = Host::new("ov1");
        let mut keyed = config("t1", None);
        keyed.ikey = Some(5);
        keyed.okey = Some(6);
        StaticTunnel::new(keyed).setup(&host.ctx).expect("setup");
        assert!(matches!(
            StaticTunnel::new(config("t2", Some(5))).setup(&host.ctx),
            Err(Error::Config(ConfigError::KeyUnavailable { .. }))
        ));
    }

    #[test]
    fn test_remove_releases_key() {
        let host = Host::new("ov1");
        let mut tunnel = StaticTunnel::new(config("t1", None));
        tunnel.setup(&host.ctx).expect("setup");
        tunnel.remove().expect("remove");
        StaticTunnel::new(config("t2", None))
            .setup(&host.ctx)
            .expect("pair free again");
    }

    #[test]
    fn test_start_creates_device_in_overlay() {
        let host = Host::new("ov1");
        let mut tunnel = StaticTunnel::new(config("tun-a", Some(3)));
        tunnel.setup(&host.ctx).expect("setup");
        assert_eq!(tunnel.tunnel_name(), Some("tuna0"));

        tunnel.start(&host.env()).expect("start");
        let link = host.netlink.get(Some("ov1"), "tuna0").expect("device");
        assert_eq!(link.kind, LinkKind::Gretap);
        assert!(host.netlink.is_up(Some("ov1"), "tuna0"));
        assert_eq!(
            host.netlink.addresses(Some("ov1"), "tuna0"),
            vec![("10.0.0.1".parse().expect("ip"), 30)]
        );

        tunnel.stop(&host.env()).expect("stop");
        assert!(!host.netlink.has_link(Some("ov1"), "tuna0"));
    }
}
