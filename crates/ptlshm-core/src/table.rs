//! Rank address table

use crate::process_id::{ProcessId, ADDRESS_SIZE};
use crate::{Error, Result};
use std::collections::HashMap;

/// Marker for a slot nobody has written yet
pub const UNSET: ProcessId = ProcessId::new(u32::MAX, u32::MAX);

/// Transport address of every rank, indexed by rank
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTable {
    entries: Vec<ProcessId>,
}

impl AddressTable {
    /// Encoded size of a table for `size` ranks
    pub fn byte_len(size: usize) -> usize {
        size * ADDRESS_SIZE
    }

    /// Landing buffer for `size` ranks with every slot marked [`UNSET`]
    pub fn blank_bytes(size: usize) -> Vec<u8> {
        UNSET.to_bytes().repeat(size)
    }

    /// Write `id` into slot `rank` of an encoded table
    pub fn write_slot(bytes: &mut [u8], rank: usize, id: ProcessId) -> Result<()> {
        let start = rank * ADDRESS_SIZE;
        let slot = bytes
            .get_mut(start..start + ADDRESS_SIZE)
            .ok_or_else(|| Error::BootstrapFailure(format!("rank {} has no slot", rank)))?;
        slot.copy_from_slice(&id.to_bytes());
        Ok(())
    }

    /// Decode and validate a table of `size` ranks
    ///
    /// Fails if the length is wrong or any slot was never written.
    pub fn from_bytes(size: usize, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::byte_len(size) {
            return Err(Error::BootstrapFailure(format!(
                "address table is {} bytes, expected {} for {} ranks",
                bytes.len(),
                Self::byte_len(size),
                size
            )));
        }
        let entries = bytes
            .chunks_exact(ADDRESS_SIZE)
            .map(ProcessId::from_bytes)
            .collect::<Result<Vec<_>>>()?;
        Self::from_entries(entries)
    }

    /// Build a table directly from addresses in rank order
    ///
    /// Every slot must be written and no address may appear twice.
    pub fn from_entries(entries: Vec<ProcessId>) -> Result<Self> {
        if let Some(rank) = entries.iter().position(|id| *id == UNSET) {
            return Err(Error::BootstrapFailure(format!("rank {} never reported", rank)));
        }
        let mut seen = HashMap::with_capacity(entries.len());
        for (rank, id) in entries.iter().enumerate() {
            if let Some(first) = seen.insert(*id, rank) {
                return Err(Error::BootstrapFailure(format!(
                    "ranks {} and {} both claim address {}",
                    first, rank, id
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.entries.iter().flat_map(|id| id.to_bytes()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rank: usize) -> Option<ProcessId> {
        self.entries.get(rank).copied()
    }

    /// Rank owning `id`, if any
    pub fn rank_of(&self, id: ProcessId) -> Option<usize> {
        self.entries.iter().position(|entry| *entry == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.entries.iter().copied()
    }

    pub fn as_slice(&self) -> &[ProcessId] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_and_decode() {
        let mut bytes = AddressTable::blank_bytes(3);
        assert_eq!(bytes.len(), 24);
        for rank in 0..3 {
            AddressTable::write_slot(&mut bytes, rank, ProcessId::new(0, 100 + rank as u32))
                .unwrap();
        }
        let table = AddressTable::from_bytes(3, &bytes).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2), Some(ProcessId::new(0, 102)));
        assert_eq!(table.rank_of(ProcessId::new(0, 101)), Some(1));
        assert_eq!(table.to_bytes(), bytes);
    }

    #[test]
    fn test_unwritten_slot_rejected() {
        let mut bytes = AddressTable::blank_bytes(2);
        AddressTable::write_slot(&mut bytes, 0, ProcessId::new(0, 1)).unwrap();
        let err = AddressTable::from_bytes(2, &bytes).unwrap_err();
        assert!(err.to_string().contains("rank 1"));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let id = ProcessId::new(0, 5);
        let err = AddressTable::from_entries(vec![id, ProcessId::new(0, 6), id]).unwrap_err();
        assert!(err.to_string().contains("ranks 0 and 2"));
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(AddressTable::from_bytes(2, &[0u8; 15]).is_err());
        let mut bytes = AddressTable::blank_bytes(1);
        assert!(AddressTable::write_slot(&mut bytes, 1, ProcessId::new(0, 0)).is_err());
    }
}
