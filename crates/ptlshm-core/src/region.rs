//! Communication pad: the shared region every sibling maps

use crate::layout::RegionLayout;
use crate::shm::SharedMemory;
use crate::{Error, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

/// A mapped communication pad
///
/// Each rank only ever writes its own arrival flag and its own buffer, so
/// the pad can be shared between threads without locking.
pub struct CommPad {
    shm: SharedMemory,
    layout: RegionLayout,
}

impl CommPad {
    /// Map the launcher-created object `name` with the given layout
    pub fn open(name: &str, layout: RegionLayout) -> Result<Self> {
        let shm = SharedMemory::open(name)?;
        if shm.size() < layout.total_size() {
            return Err(Error::MappingFailed(format!(
                "{}: object is {} bytes, layout needs {}",
                name,
                shm.size(),
                layout.total_size()
            )));
        }

        tracing::debug!(
            name,
            size = layout.total_size(),
            siblings = layout.num_siblings(),
            "mapped communication pad"
        );
        Ok(Self { shm, layout })
    }

    /// Unmap the pad. The backing object is left for the launcher to remove.
    pub fn close(self) {
        tracing::debug!(name = self.shm.name(), "unmapping communication pad");
        drop(self);
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn num_siblings(&self) -> usize {
        self.layout.num_siblings()
    }

    fn flag(&self, rank: usize) -> Result<&AtomicU8> {
        let offset = self.layout.flag_offset(rank)?;
        // SAFETY: offset is inside the first page of a live mapping, and
        // AtomicU8 has no alignment requirement.
        Ok(unsafe { &*(self.shm.as_ptr().add(offset) as *const AtomicU8) })
    }

    /// Publish this rank's arrival; flags are never cleared afterwards
    pub fn announce(&self, rank: usize) -> Result<()> {
        self.flag(rank)?.store(1, Ordering::Release);
        tracing::trace!(rank, "announced arrival");
        Ok(())
    }

    /// Whether `rank` has announced its arrival
    pub fn has_arrived(&self, rank: usize) -> Result<bool> {
        Ok(self.flag(rank)?.load(Ordering::Acquire) != 0)
    }

    /// Ranks that have not announced their arrival yet
    pub fn pending(&self) -> Vec<usize> {
        (0..self.num_siblings())
            .filter(|&rank| !matches!(self.has_arrived(rank), Ok(true)))
            .collect()
    }

    /// Whether every sibling has announced its arrival
    ///
    /// Scans in rank order and stops at the first missing flag, which keeps
    /// cache traffic low while most siblings are still absent.
    pub fn all_arrived(&self) -> bool {
        (0..self.num_siblings()).all(|rank| matches!(self.has_arrived(rank), Ok(true)))
    }

    /// Start of the buffer owned by `rank`
    pub fn buffer_ptr(&self, rank: usize) -> Result<NonNull<u8>> {
        let offset = self.layout.buffer_offset(rank)?;
        // SAFETY: buffer_offset is within total_size, which the mapping covers.
        let ptr = unsafe { self.shm.as_ptr().add(offset) };
        NonNull::new(ptr).ok_or_else(|| Error::MappingFailed("null mapping".to_string()))
    }

    /// Size of each per-rank buffer
    pub fn buffer_len(&self) -> usize {
        self.layout.comm_buf_size()
    }

    /// Copy `data` into the buffer owned by `rank`
    ///
    /// # Safety
    ///
    /// The caller must be the only writer of that rank's buffer, and no
    /// other thread may be reading the written range concurrently.
    pub unsafe fn write_buffer(&self, rank: usize, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let dst = self.buffer_ptr(rank)?.as_ptr().add(offset);
        std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        Ok(())
    }

    /// Copy bytes out of the buffer owned by `rank`
    pub fn read_buffer(&self, rank: usize, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        let src = self.buffer_ptr(rank)?.as_ptr();
        // SAFETY: range checked against the buffer; the destination is a
        // private slice.
        unsafe { std::ptr::copy_nonoverlapping(src.add(offset), out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.buffer_len() => Ok(()),
            _ => Err(Error::InvalidLayout(format!(
                "range {}+{} exceeds {} byte buffer",
                offset,
                len,
                self.buffer_len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/ptlshm_region_{}", ts)
    }

    #[test]
    fn test_arrival_flags() {
        let name = unique_name();
        let layout = RegionLayout::new(4096, 3, 256).unwrap();
        let _launcher = SharedMemory::create(&name, layout.total_size()).unwrap();

        let pad = CommPad::open(&name, layout).unwrap();
        assert!(!pad.all_arrived());
        assert_eq!(pad.pending(), vec![0, 1, 2]);

        pad.announce(0).unwrap();
        pad.announce(2).unwrap();
        assert_eq!(pad.pending(), vec![1]);
        assert!(!pad.all_arrived());

        // a second mapping of the same object sees the same flags
        let other = CommPad::open(&name, layout).unwrap();
        other.announce(1).unwrap();
        assert!(pad.all_arrived());
        assert!(pad.announce(3).is_err());
    }

    #[test]
    fn test_buffers_are_shared() {
        let name = unique_name();
        let layout = RegionLayout::new(4096, 2, 128).unwrap();
        let _launcher = SharedMemory::create(&name, layout.total_size()).unwrap();

        let a = CommPad::open(&name, layout).unwrap();
        let b = CommPad::open(&name, layout).unwrap();

        unsafe { a.write_buffer(1, 8, b"rank one").unwrap() };
        let mut out = [0u8; 8];
        b.read_buffer(1, 8, &mut out).unwrap();
        assert_eq!(&out, b"rank one");

        assert!(b.read_buffer(1, 121, &mut out).is_err());
    }

    #[test]
    fn test_object_too_small() {
        let name = unique_name();
        let _launcher = SharedMemory::create(&name, 4096).unwrap();
        let layout = RegionLayout::new(4096, 4, 4096).unwrap();
        assert!(matches!(
            CommPad::open(&name, layout),
            Err(Error::MappingFailed(_))
        ));
    }
}
