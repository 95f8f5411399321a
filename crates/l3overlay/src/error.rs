//! Error types for overlay orchestration.
//!
//! Errors fall into three families: configuration problems detected while
//! binding interfaces, lifecycle calls made out of order, and resources the
//! kernel (or an allocator) reports as unusable.

use std::net::IpAddr;

use thiserror::Error;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Ambiguous or invalid configuration, detected at read or setup time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two unkeyed tunnels share the same address pair.
    #[error("more than one tunnel without key value for address pair ({local}, {remote})")]
    NonUniqueTunnel {
        /// Local tunnel endpoint.
        local: IpAddr,
        /// Remote tunnel endpoint.
        remote: IpAddr,
    },

    /// An explicit tunnel key is already in use for the address pair.
    #[error("more than one tunnel using key value {key} for address pair ({local}, {remote})")]
    KeyUnavailable {
        /// Local tunnel endpoint.
        local: IpAddr,
        /// Remote tunnel endpoint.
        remote: IpAddr,
        /// The conflicting key.
        key: u32,
    },

    /// Both `key` and `ikey`/`okey` were given.
    #[error("interface '{0}': key and ikey/okey are mutually exclusive")]
    KeyModeConflict(String),

    /// Only one of `ikey` and `okey` was given.
    #[error("interface '{name}': {present} defined but {missing} undefined")]
    IncompleteKeyPair {
        /// Interface name.
        name: String,
        /// The key that was supplied.
        present: &'static str,
        /// The key that is missing.
        missing: &'static str,
    },

    /// Two addresses that must share a family do not.
    #[error("interface '{name}': addresses {first} and {second} must be the same IP address family")]
    AddressFamilyMismatch {
        /// Interface name.
        name: String,
        /// First address.
        first: IpAddr,
        /// Second address.
        second: IpAddr,
    },

    /// Inner and outer veth addresses were both set without bridging.
    #[error("interface '{0}': inner-address and outer-address can only both be set if outer-interface-bridged is true")]
    AddressesRequireBridge(String),

    /// An address was configured without a netmask.
    #[error("interface '{0}': netmask required when an address is set")]
    MissingNetmask(String),

    /// Netmask outside the range of the address family.
    #[error("interface '{name}': invalid netmask /{netmask} for {address}")]
    InvalidNetmask {
        /// Interface name.
        name: String,
        /// The address the netmask applies to.
        address: IpAddr,
        /// The offending prefix length.
        netmask: u8,
    },

    /// An overlay link names an overlay that does not exist.
    #[error("overlay '{overlay}' links to unknown overlay '{target}'")]
    UnknownOverlay {
        /// The referencing overlay.
        overlay: String,
        /// The missing overlay.
        target: String,
    },

    /// Two overlay configurations share a name.
    #[error("overlay '{0}' defined more than once")]
    DuplicateOverlay(String),

    /// The mesh node list does not contain this node.
    #[error("overlay '{overlay}': this node '{node}' is missing from the node list")]
    MissingThisNode {
        /// Overlay name.
        overlay: String,
        /// Configured name of this node.
        node: String,
    },

    /// Mesh linknet addresses ran past the end of the pool.
    #[error("overlay '{overlay}': linknet pool {pool} overflowed by node link ({local}, {remote})")]
    LinknetPoolOverflow {
        /// Overlay name.
        overlay: String,
        /// The pool that overflowed.
        pool: String,
        /// Local node name.
        local: String,
        /// Remote node name.
        remote: String,
    },

    /// Unreadable or malformed configuration.
    #[error("{0}")]
    Invalid(String),
}

/// A lifecycle operation invoked out of order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// `setup()` called twice.
    #[error("{0} set up twice")]
    AlreadySetup(String),

    /// Started before `setup()`.
    #[error("{0} not yet set up")]
    NotSetup(String),

    /// `start()` called while starting or started.
    #[error("{0} started twice")]
    AlreadyStarted(String),

    /// Operation requires a started worker.
    #[error("{0} not yet started")]
    NotStarted(String),

    /// `stop()` called while already stopping.
    #[error("{0} already stopping")]
    AlreadyStopping(String),

    /// `stop()` called while already stopped.
    #[error("{0} stopped twice")]
    AlreadyStopped(String),

    /// `remove()` called before `stop()`.
    #[error("{0} not yet stopped")]
    NotStopped(String),

    /// Any call after `remove()`.
    #[error("{0} removed twice")]
    AlreadyRemoved(String),
}

/// An allocator or kernel primitive reported a resource as unusable.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The kernel object already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists {
        /// Object kind (`link`, `namespace`).
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// The kernel object does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind (`link`, `namespace`).
        kind: &'static str,
        /// Object name.
        name: String,
    },

    /// An external command returned failure.
    #[error("command '{command}' failed: {message}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Captured error output.
        message: String,
    },

    /// No interface name fits within the length limit.
    #[error("no interface name available for base '{base}' within {limit} characters")]
    NameSpaceExhausted {
        /// Requested base name.
        base: String,
        /// Length limit.
        limit: usize,
    },

    /// Unregistering a mesh link that was never registered.
    #[error("unable to delete non-existent mesh link ({local}, {remote})")]
    MeshLinkNotFound {
        /// Local address.
        local: IpAddr,
        /// Remote address.
        remote: IpAddr,
    },

    /// A child process exited unsuccessfully.
    #[error("process '{command}' exited with status {status}")]
    ProcessFailed {
        /// The command that was run.
        command: String,
        /// Exit status (-1 when killed by a signal).
        status: i32,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResourceError {
    /// Returns true if this is a `NotFound` error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is an `AlreadyExists` error.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Lifecycle contract violated.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Resource unusable.
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Overlays reference each other in a loop.
    #[error("cyclic overlay dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// The overlays forming the cycle, first repeated at the end.
        cycle: Vec<String>,
    },

    /// IO error on the runtime directory.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_unique_tunnel_display() {
        let err = ConfigError::NonUniqueTunnel {
            local: "192.0.2.1".parse().expect("ip"),
            remote: "192.0.2.2".parse().expect("ip"),
        };
        assert_eq!(
            err.to_string(),
            "more than one tunnel without key value for address pair (192.0.2.1, 192.0.2.2)"
        );
    }

    #[test]
    fn test_state_error_wraps() {
        let err: Error = StateError::NotStarted("overlay 'a'".to_string()).into();
        assert_eq!(err.to_string(), "state error: overlay 'a' not yet started");
    }

    #[test]
    fn test_cycle_display() {
        let err = Error::CyclicDependency {
            cycle: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "cyclic overlay dependency: a -> b -> a");
    }

    #[test]
    fn test_resource_predicates() {
        let err = ResourceError::NotFound {
            kind: "link",
            name: "eth9".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
    }
}
