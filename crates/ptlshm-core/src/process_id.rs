//! Physical process addresses

use crate::params::parse_var;
use crate::{Error, Result};
use std::fmt;

/// Wildcard pid: let the interface choose
pub const PID_ANY: u32 = u32::MAX;

/// Size of one encoded [`ProcessId`]
pub const ADDRESS_SIZE: usize = 8;

/// Collector node id
pub const ENV_COLLECTOR_NID: &str = "PORTALS4_COLLECTOR_NID";
/// Collector process id
pub const ENV_COLLECTOR_PID: &str = "PORTALS4_COLLECTOR_PID";

/// Transport address of a process on the raw interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pub nid: u32,
    pub pid: u32,
}

impl ProcessId {
    pub const fn new(nid: u32, pid: u32) -> Self {
        Self { nid, pid }
    }

    /// Little-endian `nid` followed by `pid`
    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..4].copy_from_slice(&self.nid.to_le_bytes());
        out[4..].copy_from_slice(&self.pid.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; ADDRESS_SIZE] = bytes.try_into().map_err(|_| {
            Error::BootstrapFailure(format!(
                "address entry is {} bytes, expected {}",
                bytes.len(),
                ADDRESS_SIZE
            ))
        })?;
        let nid = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let pid = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Ok(Self { nid, pid })
    }

    /// Collector address from `PORTALS4_COLLECTOR_NID` / `PORTALS4_COLLECTOR_PID`
    pub fn collector_from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        Ok(Self {
            nid: parse_var(&lookup, ENV_COLLECTOR_NID)?,
            pid: parse_var(&lookup, ENV_COLLECTOR_PID)?,
        })
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.nid, self.pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_layout() {
        let id = ProcessId::new(0x0102_0304, 7);
        assert_eq!(id.to_bytes(), [4, 3, 2, 1, 7, 0, 0, 0]);
        assert_eq!(ProcessId::from_bytes(&id.to_bytes()).unwrap(), id);
    }

    #[test]
    fn test_short_entry() {
        assert!(ProcessId::from_bytes(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ProcessId::new(3, PID_ANY).to_string(), "3:4294967295");
    }
}
