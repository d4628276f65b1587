//! Hand-off to rank-addressed interface construction

use crate::bootstrap::{bootstrap, BootstrapConfig};
use crate::ni::RawInterface;
use crate::process_id::ProcessId;
use crate::table::AddressTable;
use crate::{Error, Result};

/// Builds a rank-addressed interface from a finished address table
pub trait LogicalInterfaceFactory {
    type Logical;

    fn init_logical(&self, size: usize, rank: usize, table: &AddressTable) -> Result<Self::Logical>;
}

/// Bootstrap over `ni`, then build the logical interface
///
/// The factory only ever sees a complete, validated table.
pub fn bootstrap_logical<I, F>(ni: I, config: &BootstrapConfig, factory: &F) -> Result<F::Logical>
where
    I: RawInterface,
    F: LogicalInterfaceFactory,
{
    let table = bootstrap(ni, config)?;
    factory.init_logical(config.size, config.rank, &table)
}

/// Minimal rank-addressed view: resolves ranks to transport addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankMap {
    rank: usize,
    table: AddressTable,
}

impl RankMap {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.table.len()
    }

    pub fn address_of(&self, rank: usize) -> Option<ProcessId> {
        self.table.get(rank)
    }

    pub fn table(&self) -> &AddressTable {
        &self.table
    }
}

/// Factory producing [`RankMap`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RankMapFactory;

impl LogicalInterfaceFactory for RankMapFactory {
    type Logical = RankMap;

    fn init_logical(&self, size: usize, rank: usize, table: &AddressTable) -> Result<RankMap> {
        if table.len() != size {
            return Err(Error::Interface(format!(
                "table has {} entries for {} ranks",
                table.len(),
                size
            )));
        }
        if rank >= size {
            return Err(Error::Interface(format!("rank {} out of range", rank)));
        }
        Ok(RankMap {
            rank,
            table: table.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_map() {
        let table = AddressTable::from_entries(vec![ProcessId::new(0, 10), ProcessId::new(0, 11)])
            .unwrap();
        let map = RankMapFactory.init_logical(2, 1, &table).unwrap();
        assert_eq!(map.rank(), 1);
        assert_eq!(map.size(), 2);
        assert_eq!(map.address_of(0), Some(ProcessId::new(0, 10)));
        assert_eq!(map.address_of(2), None);
    }

    #[test]
    fn test_size_mismatch() {
        let table = AddressTable::from_entries(vec![ProcessId::new(0, 10)]).unwrap();
        assert!(RankMapFactory.init_logical(2, 0, &table).is_err());
    }
}
