//! Netlink backend driving `ip(8)` from iproute2.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::{Child, Command, Stdio};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{Link, LinkKind, LinkParams, LinkSpec, Netlink, NetlinkResult, Process};
use crate::error::ResourceError;

/// Default path of the `ip` binary.
const IP: &str = "ip";

/// Target for moving a device back to the root namespace: the namespace of
/// PID 1.
const ROOT_NETNS_PID: &str = "1";

#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    master: Option<String>,
    #[serde(default)]
    linkinfo: Option<LinkInfo>,
}

#[derive(Debug, Deserialize)]
struct LinkInfo {
    #[serde(default)]
    info_kind: Option<String>,
    #[serde(default)]
    info_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IpNetns {
    name: String,
}

impl IpLink {
    fn kind(&self) -> LinkKind {
        let Some(info) = &self.linkinfo else {
            return LinkKind::Physical;
        };
        match info.info_kind.as_deref() {
            None => LinkKind::Physical,
            Some("gre" | "ip6gre") => LinkKind::Gre,
            Some("gretap" | "ip6gretap") => LinkKind::Gretap,
            Some("veth") => LinkKind::Veth,
            Some("bridge") => LinkKind::Bridge,
            Some("vlan") => LinkKind::Vlan,
            Some("dummy") => LinkKind::Dummy,
            Some("tun") => {
                let tap = info
                    .info_data
                    .as_ref()
                    .and_then(|data| data.get("type"))
                    .and_then(serde_json::Value::as_str)
                    == Some("tap");
                if tap { LinkKind::Tap } else { LinkKind::Tun }
            }
            Some(other) => LinkKind::Other(other.to_string()),
        }
    }
}

/// Drives `ip(8)`, scoping commands to a namespace with `-n`.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: String,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new()
    }
}

impl IpRoute2 {
    /// Uses `ip` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: IP.to_string(),
        }
    }

    /// Uses the given `ip` binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(netns: Option<&str>, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 2);
        if let Some(ns) = netns {
            argv.push("-n".to_string());
            argv.push(ns.to_string());
        }
        argv.extend(args.iter().map(|a| (*a).to_string()));
        argv
    }

    /// Run `ip` and return its standard output.
    fn run(&self, netns: Option<&str>, args: &[&str], name: &str) -> NetlinkResult<String> {
        let argv = Self::command(netns, args);
        let command_line = format!("{} {}", self.binary, argv.join(" "));
        debug!(command = %command_line, "running");

        let output = Command::new(&self.binary).args(&argv).output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(&command_line, name, stderr))
    }

    fn show(&self, netns: Option<&str>, name: &str) -> NetlinkResult<IpLink> {
        let stdout = self.run(netns, &["-d", "-j", "link", "show", "dev", name], name)?;
        let links: Vec<IpLink> = serde_json::from_str(&stdout).map_err(|e| {
            ResourceError::CommandFailed {
                command: format!("{} link show dev {name}", self.binary),
                message: format!("unparseable output: {e}"),
            }
        })?;
        links.into_iter().next().ok_or_else(|| ResourceError::NotFound {
            kind: "link",
            name: name.to_string(),
        })
    }

    fn create_args(spec: &LinkSpec) -> Vec<String> {
        let name = spec.name.clone();
        let mut args: Vec<String> = match &spec.params {
            LinkParams::Tuntap { mode, uid, gid } => {
                let mut args = vec![
                    "tuntap".to_string(),
                    "add".to_string(),
                    "dev".to_string(),
                    name,
                    "mode".to_string(),
                    mode.to_string(),
                ];
                if let Some(uid) = uid {
                    args.extend(["user".to_string(), uid.to_string()]);
                }
                if let Some(gid) = gid {
                    args.extend(["group".to_string(), gid.to_string()]);
                }
                return args;
            }
            _ => vec!["link".to_string(), "add".to_string(), "name".to_string(), name],
        };

        match &spec.params {
            LinkParams::Gre(gre) => {
                let kind = match (gre.local.is_ipv6(), gre.tap) {
                    (false, false) => "gre",
                    (false, true) => "gretap",
                    (true, false) => "ip6gre",
                    (true, true) => "ip6gretap",
                };
                args.extend([
                    "type".to_string(),
                    kind.to_string(),
                    "local".to_string(),
                    gre.local.to_string(),
                    "remote".to_string(),
                    gre.remote.to_string(),
                    "ttl".to_string(),
                    gre.ttl.to_string(),
                ]);
                if let Some(ikey) = gre.ikey {
                    args.extend(["ikey".to_string(), ikey.to_string()]);
                }
                if let Some(okey) = gre.okey {
                    args.extend(["okey".to_string(), okey.to_string()]);
                }
            }
            LinkParams::Veth { peer } => {
                args.extend([
                    "type".to_string(),
                    "veth".to_string(),
                    "peer".to_string(),
                    "name".to_string(),
                    peer.clone(),
                ]);
            }
            LinkParams::Bridge => args.extend(["type".to_string(), "bridge".to_string()]),
            LinkParams::Vlan { parent, id } => {
                args.extend([
                    "link".to_string(),
                    parent.clone(),
                    "type".to_string(),
                    "vlan".to_string(),
                    "id".to_string(),
                    id.to_string(),
                ]);
            }
            LinkParams::Dummy => args.extend(["type".to_string(), "dummy".to_string()]),
            LinkParams::Tuntap { .. } => {}
        }
        args
    }
}

/// Map `ip(8)` error text to a resource error.
fn classify(command: &str, name: &str, stderr: String) -> ResourceError {
    if stderr.contains("File exists") {
        ResourceError::AlreadyExists {
            kind: "link",
            name: name.to_string(),
        }
    } else if stderr.contains("does not exist")
        || stderr.contains("Cannot find device")
        || stderr.contains("No such file or directory")
    {
        ResourceError::NotFound {
            kind: "link",
            name: name.to_string(),
        }
    } else {
        ResourceError::CommandFailed {
            command: command.to_string(),
            message: stderr,
        }
    }
}

impl Netlink for IpRoute2 {
    fn create(&self, netns: Option<&str>, spec: &LinkSpec) -> NetlinkResult<Link> {
        let args = Self::create_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(netns, &args, &spec.name)?;
        Ok(Link {
            name: spec.name.clone(),
            netns: netns.map(str::to_string),
            kind: spec.kind(),
        })
    }

    fn get(&self, netns: Option<&str>, name: &str) -> NetlinkResult<Link> {
        let link = self.show(netns, name)?;
        Ok(Link {
            kind: link.kind(),
            name: link.ifname,
            netns: netns.map(str::to_string),
        })
    }

    fn remove(&self, link: &Link) -> NetlinkResult<()> {
        self.run(link.netns(), &["link", "del", "dev", &link.name], &link.name)?;
        Ok(())
    }

    fn add_ip(&self, link: &Link, address: IpAddr, prefix_len: u8) -> NetlinkResult<()> {
        let cidr = format!("{address}/{prefix_len}");
        match self.run(
            link.netns(),
            &["addr", "add", &cidr, "dev", &link.name],
            &link.name,
        ) {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(interface = %link.name, address = %cidr, "address already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn set_up(&self, link: &Link) -> NetlinkResult<()> {
        self.run(
            link.netns(),
            &["link", "set", "dev", &link.name, "up"],
            &link.name,
        )?;
        Ok(())
    }

    fn set_namespace(&self, link: &Link, netns: Option<&str>) -> NetlinkResult<Link> {
        let target = netns.unwrap_or(ROOT_NETNS_PID);
        self.run(
            link.netns(),
            &["link", "set", "dev", &link.name, "netns", target],
            &link.name,
        )?;
        Ok(Link {
            name: link.name.clone(),
            netns: netns.map(str::to_string),
            kind: link.kind.clone(),
        })
    }

    fn set_master(&self, link: &Link, bridge: &Link) -> NetlinkResult<()> {
        self.run(
            link.netns(),
            &["link", "set", "dev", &link.name, "master", &bridge.name],
            &link.name,
        )?;
        Ok(())
    }

    fn master(&self, link: &Link) -> NetlinkResult<Option<String>> {
        Ok(self.show(link.netns(), &link.name)?.master)
    }

    fn commit(&self, _netns: Option<&str>) -> NetlinkResult<()> {
        // Every ip(8) invocation is applied immediately.
        Ok(())
    }

    fn namespace_create(&self, name: &str) -> NetlinkResult<()> {
        match self.run(None, &["netns", "add", name], name) {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn namespace_remove(&self, name: &str) -> NetlinkResult<()> {
        self.run(None, &["netns", "del", name], name)?;
        Ok(())
    }

    fn namespace_list(&self) -> NetlinkResult<BTreeSet<String>> {
        let stdout = self.run(None, &["-j", "netns", "list"], "netns")?;
        // Older iproute2 prints nothing at all when no namespaces exist.
        if stdout.trim().is_empty() {
            return Ok(BTreeSet::new());
        }
        let namespaces: Vec<IpNetns> =
            serde_json::from_str(&stdout).map_err(|e| ResourceError::CommandFailed {
                command: format!("{} netns list", self.binary),
                message: format!("unparseable output: {e}"),
            })?;
        Ok(namespaces.into_iter().map(|ns| ns.name).collect())
    }

    fn popen(&self, netns: Option<&str>, argv: &[String]) -> NetlinkResult<Box<dyn Process>> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ResourceError::CommandFailed {
                command: String::new(),
                message: "empty command line".to_string(),
            });
        };

        let mut command = match netns {
            Some(ns) => {
                let mut command = Command::new(&self.binary);
                command
                    .args(["netns", "exec", ns, program.as_str()])
                    .args(args);
                command
            }
            None => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        };

        let child = command.stdin(Stdio::null()).spawn()?;
        debug!(netns = ?netns, command = %argv.join(" "), pid = child.id(), "spawned");
        Ok(Box::new(ChildProcess {
            command: argv.join(" "),
            child: Some(child),
        }))
    }
}

/// A real child process.
#[derive(Debug)]
struct ChildProcess {
    command: String,
    child: Option<Child>,
}

impl Process for ChildProcess {
    fn wait(&mut self) -> NetlinkResult<i32> {
        let Some(child) = self.child.as_mut() else {
            return Err(ResourceError::CommandFailed {
                command: self.command.clone(),
                message: "process already released".to_string(),
            });
        };
        let status = child.wait()?;
        Ok(status.code().unwrap_or(-1))
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(None)) {
                warn!(command = %self.command, "killing process still running at release");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.release();
    }
}
