//! Launch parameters handed down by the launcher

use crate::{Error, Result};
use nix::unistd::{sysconf, SysconfVar};

/// Name of the shared memory object holding the communication pad
pub const ENV_SHM_NAME: &str = "PORTALS4_SHM_NAME";
/// Number of sibling processes in the group
pub const ENV_NUM_PROCS: &str = "PORTALS4_NUM_PROCS";
/// Zero-based rank of this process
pub const ENV_RANK: &str = "PORTALS4_RANK";
/// Per-process communication buffer size in bytes
pub const ENV_COMM_SIZE: &str = "PORTALS4_COMM_SIZE";

/// Page size used when the platform cannot be queried
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Native page size of the platform
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Parameters every sibling reads once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    /// Shared memory object name
    pub shm_name: String,
    /// Total sibling count N
    pub num_siblings: usize,
    /// This process's rank R, `0 <= R < N`
    pub rank: usize,
    /// Per-process communication buffer size B
    pub comm_buf_size: usize,
}

impl LaunchParams {
    /// Build parameters explicitly, validating rank and sibling count
    pub fn new(
        shm_name: impl Into<String>,
        num_siblings: usize,
        rank: usize,
        comm_buf_size: usize,
    ) -> Result<Self> {
        let params = Self {
            shm_name: shm_name.into(),
            num_siblings,
            rank,
            comm_buf_size,
        };
        params.validate()?;
        Ok(params)
    }

    /// Read parameters from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read parameters through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let shm_name = lookup(ENV_SHM_NAME)
            .ok_or_else(|| Error::Configuration(format!("{} is not set", ENV_SHM_NAME)))?;
        let num_siblings = parse_var(&lookup, ENV_NUM_PROCS)?;
        let rank = parse_var(&lookup, ENV_RANK)?;
        let comm_buf_size = parse_var(&lookup, ENV_COMM_SIZE)?;

        Self::new(shm_name, num_siblings, rank, comm_buf_size)
    }

    fn validate(&self) -> Result<()> {
        if self.shm_name.is_empty() {
            return Err(Error::Configuration("empty shared memory name".to_string()));
        }
        if self.num_siblings == 0 {
            return Err(Error::Configuration("sibling count must be positive".to_string()));
        }
        if self.rank >= self.num_siblings {
            return Err(Error::Configuration(format!(
                "rank {} out of range for {} siblings",
                self.rank, self.num_siblings
            )));
        }
        Ok(())
    }

    /// Interface limits implied by these parameters
    pub fn limits(&self) -> NiLimits {
        NiLimits::for_comm_buf(self.comm_buf_size)
    }
}

pub(crate) fn parse_var<F, T>(lookup: &F, key: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key).ok_or_else(|| Error::Configuration(format!("{} is not set", key)))?;
    raw.trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{} is not a number: {:?}", key, raw)))
}

/// Resource limits advertised by interfaces built on the communication pad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NiLimits {
    pub max_mes: usize,
    pub max_mds: usize,
    pub max_cts: usize,
    pub max_eqs: usize,
    pub max_pt_index: usize,
    pub max_iovecs: usize,
    pub max_me_list: usize,
    pub max_msg_size: usize,
    pub max_atomic_size: usize,
}

impl NiLimits {
    /// Highest portal table index
    pub const MAX_PT_INDEX: usize = 63;
    /// Largest atomic operand in bytes
    pub const MAX_ATOMIC_SIZE: usize = 8;

    fn for_comm_buf(comm_buf_size: usize) -> Self {
        let unbounded = i32::MAX as usize;
        Self {
            max_mes: unbounded,
            max_mds: unbounded,
            max_cts: unbounded,
            max_eqs: unbounded,
            max_pt_index: Self::MAX_PT_INDEX,
            max_iovecs: unbounded,
            max_me_list: unbounded,
            // a message never exceeds one sibling's buffer
            max_msg_size: comm_buf_size,
            max_atomic_size: Self::MAX_ATOMIC_SIZE,
        }
    }
}
