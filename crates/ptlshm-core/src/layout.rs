//! Communication pad layout
//!
//! ```text
//! +-------------------------------+  offset 0
//! | arrival flags, one byte/rank  |
//! | (padded to one page)          |
//! +-------------------------------+  offset page_size
//! | rank 0 buffer (B bytes)       |
//! +-------------------------------+
//! | ...                           |
//! +-------------------------------+
//! | rank N-1 buffer (B bytes)     |
//! +-------------------------------+  page_size + B*N
//! ```

use crate::params::LaunchParams;
use crate::{Error, Result};

/// Offsets into the communication pad, computed once at mapping time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    page_size: usize,
    num_siblings: usize,
    comm_buf_size: usize,
    total_size: usize,
}

impl RegionLayout {
    /// Compute and validate the layout for `num_siblings` buffers of `comm_buf_size`
    pub fn new(page_size: usize, num_siblings: usize, comm_buf_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidLayout("page size is zero".to_string()));
        }
        if num_siblings == 0 {
            return Err(Error::InvalidLayout("no siblings".to_string()));
        }
        if num_siblings > page_size {
            return Err(Error::InvalidLayout(format!(
                "{} arrival flags do not fit in a {} byte page",
                num_siblings, page_size
            )));
        }
        let total_size = comm_buf_size
            .checked_mul(num_siblings)
            .and_then(|buffers| buffers.checked_add(page_size))
            .ok_or_else(|| {
                Error::InvalidLayout(format!(
                    "{} buffers of {} bytes overflow the address space",
                    num_siblings, comm_buf_size
                ))
            })?;

        Ok(Self {
            page_size,
            num_siblings,
            comm_buf_size,
            total_size,
        })
    }

    /// Layout for the given launch parameters at the given page size
    pub fn for_params(params: &LaunchParams, page_size: usize) -> Result<Self> {
        Self::new(page_size, params.num_siblings, params.comm_buf_size)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_siblings(&self) -> usize {
        self.num_siblings
    }

    pub fn comm_buf_size(&self) -> usize {
        self.comm_buf_size
    }

    /// Size of the whole mapping: `page_size + B*N`
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Offset of the arrival flag for `rank`
    pub fn flag_offset(&self, rank: usize) -> Result<usize> {
        self.check_rank(rank)?;
        Ok(rank)
    }

    /// Offset of the communication buffer owned by `rank`
    pub fn buffer_offset(&self, rank: usize) -> Result<usize> {
        self.check_rank(rank)?;
        Ok(self.page_size + rank * self.comm_buf_size)
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.num_siblings {
            return Err(Error::InvalidLayout(format!(
                "rank {} out of range for {} siblings",
                rank, self.num_siblings
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        let layout = RegionLayout::new(4096, 4, 1024).unwrap();
        assert_eq!(layout.total_size(), 4096 + 4 * 1024);
        assert_eq!(layout.flag_offset(3).unwrap(), 3);
        assert_eq!(layout.buffer_offset(0).unwrap(), 4096);
        assert_eq!(layout.buffer_offset(3).unwrap(), 4096 + 3 * 1024);
        assert!(layout.buffer_offset(4).is_err());
    }

    #[test]
    fn test_zero_sized_buffers() {
        let layout = RegionLayout::new(4096, 8, 0).unwrap();
        assert_eq!(layout.total_size(), 4096);
    }

    #[test]
    fn test_too_many_siblings() {
        assert!(matches!(
            RegionLayout::new(4096, 4097, 16),
            Err(Error::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_overflow() {
        assert!(RegionLayout::new(4096, 2, usize::MAX / 2 + 1).is_err());
    }
}
