//! strongSwan control through `ipsec(8)`.

use std::process::{Command, Stdio};

use l3overlay::{IpsecControl, MeshLink, ResourceError};
use tracing::{debug, info};

/// `ipsec status` exit code when the daemon is not running.
const STATUS_NOT_RUNNING: i32 = 3;

/// Drives a strongSwan installation with the `ipsec` command.
///
/// The connection and secret files are generated elsewhere; this only
/// tells the running daemon to pick them up, or starts it.
#[derive(Debug, Clone)]
pub struct StrongswanCtl {
    binary: String,
    manage: bool,
}

impl StrongswanCtl {
    /// Uses `ipsec` from `PATH`. With `manage`, the IPsec daemon is
    /// stopped along with l3overlay.
    #[must_use]
    pub fn new(manage: bool) -> Self {
        Self::with_binary("ipsec", manage)
    }

    /// Uses the given `ipsec` binary.
    #[must_use]
    pub fn with_binary(binary: impl Into<String>, manage: bool) -> Self {
        Self {
            binary: binary.into(),
            manage,
        }
    }

    fn status(&self) -> Result<i32, ResourceError> {
        let status = Command::new(&self.binary)
            .arg("status")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.code().unwrap_or(-1))
    }

    fn run(&self, args: &[&str]) -> Result<(), ResourceError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %command, "running");

        let output = Command::new(&self.binary).args(args).output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ResourceError::CommandFailed {
                command,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// strongSwan connection name of a mesh link.
pub fn conn_name((local, remote): &MeshLink) -> String {
    format!("{local}-{remote}")
}

impl IpsecControl for StrongswanCtl {
    fn apply(&self, links: &[MeshLink]) -> Result<(), ResourceError> {
        info!(links = links.len(), "applying ipsec configuration");
        match self.status()? {
            0 => {
                self.run(&["rereadsecrets"])?;
                self.run(&["reload"])
            }
            STATUS_NOT_RUNNING => self.run(&["start"]),
            status => Err(ResourceError::ProcessFailed {
                command: format!("{} status", self.binary),
                status,
            }),
        }
    }

    fn withdraw(&self, links: &[MeshLink]) -> Result<(), ResourceError> {
        if self.manage {
            info!("stopping ipsec");
            return self.run(&["stop"]);
        }

        self.run(&["rereadsecrets"])?;
        self.run(&["reload"])?;
        for link in links {
            let conn = conn_name(link);
            debug!(conn = %conn, "shutting down ipsec tunnel");
            self.run(&["down", &conn])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn link() -> MeshLink {
        ("192.0.2.1".parse().expect("ip"), "192.0.2.2".parse().expect("ip"))
    }

    #[test]
    fn test_conn_name() {
        assert_eq!(conn_name(&link()), "192.0.2.1-192.0.2.2");
    }

    #[test_case("true", true ; "running daemon is reloaded")]
    #[test_case("false", false ; "unexpected status is an error")]
    fn test_apply_follows_status(binary: &str, ok: bool) {
        let ctl = StrongswanCtl::with_binary(binary, false);
        assert_eq!(ctl.apply(&[link()]).is_ok(), ok);
    }

    #[test_case(true ; "managed")]
    #[test_case(false ; "unmanaged")]
    fn test_withdraw_runs(manage: bool) {
        let ctl = StrongswanCtl::with_binary("true", manage);
        ctl.withdraw(&[link()]).expect("withdraw");
    }

    #[test]
    fn test_missing_binary() {
        let ctl = StrongswanCtl::with_binary("/nonexistent/ipsec", false);
        assert!(matches!(ctl.apply(&[]), Err(ResourceError::Io(_))));
    }
}
