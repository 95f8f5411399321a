//! l3overlayd - layer 3 overlay network daemon
//!
//! Builds every configured overlay when started and tears them down again
//! on SIGINT or SIGTERM.

mod ipsec;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use l3overlay::{Daemon, DaemonConfig, DryRunNetlink, IpRoute2, IpsecControl, Netlink, NoIpsec};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::ipsec::StrongswanCtl;

#[derive(Parser)]
#[command(name = "l3overlayd")]
#[command(about = "Layer 3 overlay networks over Linux network namespaces")]
#[command(version)]
struct Cli {
    /// Path to the daemon config file
    #[arg(short, long, env = "L3OVERLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the overlays and hold them until signalled
    Run {
        /// Record kernel operations instead of applying them
        #[arg(long)]
        dry_run: bool,

        /// Runtime state directory
        #[arg(long)]
        lib_dir: Option<PathBuf>,

        /// Directory of overlay config files
        #[arg(long)]
        overlay_conf_dir: Option<PathBuf>,

        /// Base directory for relative firewall script paths
        #[arg(long)]
        fwbuilder_script_dir: Option<PathBuf>,
    },

    /// Validate the overlay configs and print the start order
    Check {
        /// Directory of overlay config files
        #[arg(long)]
        overlay_conf_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "l3overlay={level},l3overlayd={level}",
            level = cli.log_level
        ))
    });
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            dry_run,
            lib_dir,
            overlay_conf_dir,
            fwbuilder_script_dir,
        } => {
            config.dry_run |= dry_run;
            if let Some(dir) = lib_dir {
                config.lib_dir = dir;
            }
            if let Some(dir) = overlay_conf_dir {
                config.overlay_conf_dir = dir;
            }
            if fwbuilder_script_dir.is_some() {
                config.fwbuilder_script_dir = fwbuilder_script_dir;
            }
            config.validate()?;
            run(config).await?;
        }

        Commands::Check { overlay_conf_dir } => {
            if let Some(dir) = overlay_conf_dir {
                config.overlay_conf_dir = dir;
            }
            config.validate()?;
            check(config)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DaemonConfig> {
    let Some(path) = path else {
        return Ok(DaemonConfig::default());
    };
    let config = DaemonConfig::from_file(path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    info!(path = %path.display(), "loaded config");
    Ok(config)
}

fn build_daemon(config: DaemonConfig, netlink: Arc<dyn Netlink>) -> anyhow::Result<Daemon> {
    let overlays = l3overlay::config::load_overlays(&config.overlay_conf_dir).with_context(|| {
        format!(
            "loading overlays from {}",
            config.overlay_conf_dir.display()
        )
    })?;

    let ipsec: Box<dyn IpsecControl> = if config.use_ipsec && !config.dry_run {
        Box::new(StrongswanCtl::new(config.ipsec_manage))
    } else {
        Box::new(NoIpsec)
    };

    Ok(Daemon::new(config, overlays, netlink, ipsec)?)
}

fn check(config: DaemonConfig) -> anyhow::Result<()> {
    let dir = config.overlay_conf_dir.clone();
    let daemon = build_daemon(config, Arc::new(DryRunNetlink::new()))?;

    println!("{} overlay(s) in {}", daemon.order().len(), dir.display());
    for (i, name) in daemon.order().iter().enumerate() {
        println!("  {}. {name}", i + 1);
    }
    Ok(())
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let netlink: Arc<dyn Netlink> = if config.dry_run {
        info!("dry run: kernel changes are recorded, not applied");
        Arc::new(DryRunNetlink::new())
    } else {
        Arc::new(IpRoute2::new())
    };

    let mut daemon = build_daemon(config, netlink)?;
    info!(order = ?daemon.order(), "resolved overlay start order");

    daemon.setup()?;
    if let Err(e) = daemon.start() {
        error!(error = %e, "failed to start");
        return Err(e.into());
    }
    info!("started, waiting for signal");

    wait_for_signal().await?;

    info!("stopping");
    daemon.stop()?;
    daemon.remove()?;
    info!("finished");
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "l3overlayd",
            "run",
            "--dry-run",
            "--lib-dir",
            "/tmp/l3",
            "--overlay-conf-dir",
            "/tmp/overlays",
        ])
        .expect("parse");

        match cli.command {
            Commands::Run {
                dry_run,
                lib_dir,
                overlay_conf_dir,
                fwbuilder_script_dir,
            } => {
                assert!(dry_run);
                assert_eq!(lib_dir, Some(PathBuf::from("/tmp/l3")));
                assert_eq!(overlay_conf_dir, Some(PathBuf::from("/tmp/overlays")));
                assert!(fwbuilder_script_dir.is_none());
            }
            Commands::Check { .. } => panic!("expected run"),
        }
    }

    #[test_case(&["l3overlayd", "check"] ; "check")]
    #[test_case(&["l3overlayd", "--log-level", "debug", "run"] ; "run with log level")]
    fn test_cli_accepts(args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_ok());
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["l3overlayd"]).is_err());
    }

    #[test]
    fn test_default_config_without_path() {
        let config = load_config(None).expect("config");
        assert_eq!(config.lib_dir, DaemonConfig::default().lib_dir);
    }
}
