//! POSIX shared memory wrapper

use crate::{Error, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};

/// Shared memory mapping
///
/// A mapping obtained with [`SharedMemory::open`] never removes the backing
/// object; only the creator (the launcher) does, when it drops its handle.
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
    owner: bool,
}

// SAFETY: the mapping is plain shared bytes; all cross-thread access to it
// goes through atomics or disjoint per-rank ranges.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Create a new shared memory object and map it (launcher side)
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| classify(name, e))?;

        tracing::debug!(name, size, "created shared memory object");
        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
            owner: true,
        })
    }

    /// Open an existing shared memory object and map it read/write, shared
    pub fn open(name: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| classify(name, e))?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
            owner: false,
        })
    }

    /// Get the name of the shared memory object
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the size of the mapping
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created (and will remove) the backing object
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Get a raw pointer to the shared memory
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }
}

fn classify(name: &str, err: ShmemError) -> Error {
    match err {
        ShmemError::MapOpenFailed(_) => {
            Error::ResourceUnavailable(format!("{}: {}", name, err))
        }
        other => Error::MappingFailed(format!("{}: {}", name, other)),
    }
}
