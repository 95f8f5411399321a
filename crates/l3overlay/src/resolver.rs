//! Start order across overlays.
//!
//! An overlay depends on another when one of its veths reaches into the
//! other's namespace, or when it has an overlay link to it. Dependencies
//! start first and stop last. Overlays are visited in name order, so the
//! result is deterministic for a given set of configurations.

use std::collections::BTreeMap;

use crate::error::{ConfigError, Error, Result};
use crate::interface::InterfaceVariant;
use crate::overlay::Overlay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct Resolver<'a> {
    overlays: &'a BTreeMap<String, Overlay>,
    marks: BTreeMap<&'a str, Mark>,
    path: Vec<&'a str>,
    order: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn visit(&mut self, name: &'a str) -> Result<()> {
        match self.marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = self.path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> =
                    self.path[start..].iter().map(ToString::to_string).collect();
                cycle.push(name.to_string());
                return Err(Error::CyclicDependency { cycle });
            }
            None => {}
        }

        let overlays = self.overlays;
        let Some(overlay) = overlays.get(name) else {
            return Ok(());
        };

        self.marks.insert(name, Mark::InProgress);
        self.path.push(name);

        for dependency in dependencies(overlay, overlays)? {
            if dependency != name {
                self.visit(dependency)?;
            }
        }

        self.path.pop();
        self.marks.insert(name, Mark::Done);
        self.order.push(name.to_string());
        Ok(())
    }
}

/// Overlays referenced by `overlay`'s interfaces, in interface order.
fn dependencies<'a>(
    overlay: &'a Overlay,
    overlays: &BTreeMap<String, Overlay>,
) -> Result<Vec<&'a str>> {
    let mut found = Vec::new();
    for interface in overlay.interfaces() {
        match interface.variant() {
            InterfaceVariant::Veth(veth) => {
                // A veth may reach into any namespace; only overlays count.
                if let Some(netns) = veth.inner_namespace() {
                    if overlays.contains_key(netns) {
                        found.push(netns);
                    }
                }
            }
            InterfaceVariant::OverlayLink(link) => {
                let target = link.inner_overlay();
                if !overlays.contains_key(target) {
                    return Err(ConfigError::UnknownOverlay {
                        overlay: overlay.name().to_string(),
                        target: target.to_string(),
                    }
                    .into());
                }
                found.push(target);
            }
            _ => {}
        }
    }
    Ok(found)
}

/// Order overlays so that every overlay comes after the overlays it
/// depends on.
///
/// # Errors
///
/// Returns [`Error::CyclicDependency`] if overlays depend on each other in
/// a loop, and [`ConfigError::UnknownOverlay`] for an overlay link to an
/// overlay that does not exist.
pub fn resolve(overlays: &BTreeMap<String, Overlay>) -> Result<Vec<String>> {
    let mut resolver = Resolver {
        overlays,
        marks: BTreeMap::new(),
        path: Vec::new(),
        order: Vec::with_capacity(overlays.len()),
    };
    for name in overlays.keys() {
        resolver.visit(name)?;
    }
    Ok(resolver.order)
}
