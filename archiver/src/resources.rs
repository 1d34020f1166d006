//! Acquired OS resources of one archive and their ordered release.
//!
//! Resources nest like a stack (loop device, then encrypted mapping, then
//! mount) and are always released in exactly the reverse order. Releasing is
//! best effort: every held resource gets a release attempt, and the ones that
//! could not be released are reported by identifier so they can be cleaned
//! up by hand.

use crate::backend::{Backends, BackendResult, LoopDevice};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One acquired resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Loop device bound to the container file
    Loop(LoopDevice),
    /// Decrypted mapping of the container
    Mapping { name: String, device: PathBuf },
    /// Mount point holding the mapped filesystem
    Mount { path: PathBuf },
}

impl Resource {
    /// Position in the acquisition order.
    fn depth(&self) -> u8 {
        match self {
            Resource::Loop(_) => 0,
            Resource::Mapping { .. } => 1,
            Resource::Mount { .. } => 2,
        }
    }

    /// Identifier usable for manual cleanup.
    pub fn identifier(&self) -> String {
        match self {
            Resource::Loop(device) => device.to_string(),
            Resource::Mapping { device, .. } => device.display().to_string(),
            Resource::Mount { path } => path.display().to_string(),
        }
    }

    fn release(&self, backends: &Backends) -> BackendResult<()> {
        match self {
            Resource::Mount { path } => {
                backends.mount.unmount(path)?;
                backends.mount.remove_mount_point(path)
            }
            Resource::Mapping { name, .. } => backends.crypt.close(name),
            Resource::Loop(device) => backends.loops.detach(device),
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Loop(device) => write!(f, "loop device {device}"),
            Resource::Mapping { device, .. } => write!(f, "mapping {}", device.display()),
            Resource::Mount { path } => write!(f, "mount {}", path.display()),
        }
    }
}

/// LIFO of acquired resources.
#[derive(Debug, Default)]
pub struct ResourceStack {
    held: Vec<Resource>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly acquired resource. Must be deeper than everything
    /// already held.
    pub fn push(&mut self, resource: Resource) {
        debug_assert!(
            self.held
                .last()
                .map_or(true, |top| top.depth() < resource.depth()),
            "{resource} acquired out of order"
        );
        info!("Acquired {}", resource);
        self.held.push(resource);
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Held resources in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.held.iter()
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.held.iter().map(Resource::identifier).collect()
    }

    /// Release everything, most recent first. Returns the identifiers of the
    /// resources that could not be released; the stack is empty afterwards.
    pub fn release_all(&mut self, backends: &Backends) -> Vec<String> {
        let mut remaining = Vec::new();
        while let Some(resource) = self.held.pop() {
            match resource.release(backends) {
                Ok(()) => info!("Released {}", resource),
                Err(e) => {
                    warn!("Failed to release {}: {}", resource, e);
                    remaining.push(resource.identifier());
                }
            }
        }
        remaining
    }

    /// Stop tracking every resource without releasing it.
    pub fn abandon(&mut self) -> Vec<Resource> {
        std::mem::take(&mut self.held)
    }
}

/// Per-archive state owned by the lifecycle state machine. Rebuilt on every
/// run; nothing here is persisted.
#[derive(Debug)]
pub struct ContainerState {
    pub container_path: PathBuf,
    /// Block-rounded size of the source tree, set once the inventory ran
    pub source_size_bytes: u64,
    resources: ResourceStack,
}

impl ContainerState {
    pub fn new(container_path: impl Into<PathBuf>) -> Self {
        Self {
            container_path: container_path.into(),
            source_size_bytes: 0,
            resources: ResourceStack::new(),
        }
    }

    pub fn loop_device(&self) -> Option<&LoopDevice> {
        self.resources.iter().find_map(|resource| match resource {
            Resource::Loop(device) => Some(device),
            _ => None,
        })
    }

    /// Name and device node of the decrypted mapping.
    pub fn mapped_volume(&self) -> Option<(&str, &Path)> {
        self.resources.iter().find_map(|resource| match resource {
            Resource::Mapping { name, device } => Some((name.as_str(), device.as_path())),
            _ => None,
        })
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.resources.iter().find_map(|resource| match resource {
            Resource::Mount { path } => Some(path.as_path()),
            _ => None,
        })
    }

    pub fn resources(&self) -> &ResourceStack {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceStack {
        &mut self.resources
    }
}
