//! Process-wide allocation of kernel-visible resources.
//!
//! Two allocators are owned by the daemon and shared with every overlay:
//!
//! - [`GreKeyAllocator`] hands out GRE keys per (local, remote) address
//!   pair, both sequentially (mesh tunnels) and by explicit registration
//!   (static tunnels, whose keys must match on both ends).
//! - [`InterfaceNameAllocator`] hands out unique kernel interface names
//!   within the 15 character `IFNAMSIZ` limit.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::ResourceError;

/// Maximum length of a Linux interface name.
pub const IFNAME_LIMIT: usize = 15;

/// An ordered (local, remote) address pair.
pub type AddressPair = (IpAddr, IpAddr);

/// Allocator for GRE demultiplexing keys.
#[derive(Debug, Default)]
pub struct GreKeyAllocator {
    /// Sequential keys, never reclaimed.
    sequential: RwLock<HashMap<AddressPair, u32>>,
    /// Explicit registrations; `None` marks an unkeyed tunnel.
    explicit: RwLock<HashMap<AddressPair, HashSet<Option<u32>>>>,
}

impl GreKeyAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sequential key for the pair, assigning the next one on
    /// first request.
    pub fn get_or_create(&self, local: IpAddr, remote: IpAddr) -> u32 {
        let mut keys = self.sequential.write();
        let next = keys.len() as u32;
        let key = *keys.entry((local, remote)).or_insert(next);
        debug!(%local, %remote, key, "sequential GRE key");
        key
    }

    /// Registers an explicit key (or the absence of one) for the pair.
    ///
    /// Returns `true` if the (pair, key) combination was previously
    /// unregistered.
    pub fn register(&self, local: IpAddr, remote: IpAddr, key: Option<u32>) -> bool {
        let inserted = self
            .explicit
            .write()
            .entry((local, remote))
            .or_default()
            .insert(key);
        debug!(%local, %remote, ?key, inserted, "registered GRE key");
        inserted
    }

    /// Releases an explicit registration. Unknown registrations are ignored.
    pub fn release(&self, local: IpAddr, remote: IpAddr, key: Option<u32>) {
        let mut explicit = self.explicit.write();
        if let Some(keys) = explicit.get_mut(&(local, remote)) {
            keys.remove(&key);
            if keys.is_empty() {
                explicit.remove(&(local, remote));
            }
            debug!(%local, %remote, ?key, "released GRE key");
        }
    }

    /// Number of pairs holding a sequential key.
    #[must_use]
    pub fn sequential_count(&self) -> usize {
        self.sequential.read().len()
    }

    /// Whether the (pair, key) combination is registered.
    #[must_use]
    pub fn is_registered(&self, local: IpAddr, remote: IpAddr, key: Option<u32>) -> bool {
        self.explicit
            .read()
            .get(&(local, remote))
            .is_some_and(|keys| keys.contains(&key))
    }
}

/// Allocator for unique, length-bounded interface names.
#[derive(Debug, Default)]
pub struct InterfaceNameAllocator {
    allocated: RwLock<HashSet<String>>,
}

impl InterfaceNameAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a name from `base`, with an optional fixed `suffix`,
    /// followed by the lowest free disambiguating number.
    ///
    /// Non-alphanumeric characters are stripped from `base`, which is then
    /// truncated so that the whole name fits within `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::NameSpaceExhausted`] if `limit` cannot hold
    /// the suffix and a number.
    pub fn allocate(
        &self,
        base: &str,
        suffix: Option<&str>,
        limit: usize,
    ) -> Result<String, ResourceError> {
        let sanitized: String = base.chars().filter(char::is_ascii_alphanumeric).collect();
        let suffix = suffix.unwrap_or("");
        let mut allocated = self.allocated.write();

        let mut n: u64 = 0;
        loop {
            let number = n.to_string();
            let reserved = suffix.len() + number.len();
            if reserved > limit {
                return Err(ResourceError::NameSpaceExhausted {
                    base: base.to_string(),
                    limit,
                });
            }

            let prefix_len = sanitized.len().min(limit - reserved);
            let candidate = format!("{}{suffix}{number}", &sanitized[..prefix_len]);

            if !allocated.contains(&candidate) {
                debug!(base, name = %candidate, "allocated interface name");
                allocated.insert(candidate.clone());
                return Ok(candidate);
            }

            n += 1;
        }
    }

    /// Whether the name has been allocated.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.allocated.read().contains(name)
    }

    /// Number of allocated names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocated.read().len()
    }

    /// Whether no names have been allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocated.read().is_empty()
    }
}

/// The daemon's shared allocators.
#[derive(Debug, Clone, Default)]
pub struct Allocators {
    /// GRE key allocator.
    pub gre_keys: Arc<GreKeyAllocator>,
    /// Interface name allocator.
    pub interface_names: Arc<InterfaceNameAllocator>,
}

impl Allocators {
    /// Fresh, empty allocators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
