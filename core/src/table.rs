use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{
    ctx::RainbowTableParams,
    error::{RtError, RtResult},
};

/// A chain of the rainbow table: the last preimage index reached from a
/// start index after `chain_len` reduce→hash steps, and that start index.
/// The field order is the sort order and the on-disk order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct RainbowChain {
    pub endpoint: u64,
    pub startpoint: u64,
}

// Lets device buffers hold chains directly; the layout matches a pair of
// device ulongs.
#[cfg(feature = "opencl")]
unsafe impl ocl::OclPrm for RainbowChain {}

/// A sorted, endpoint-deduplicated set of chains together with the
/// parameters it was generated with. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RainbowTable {
    params: RainbowTableParams,
    chains: Vec<RainbowChain>,
}

impl RainbowTable {
    /// Creates a table from freshly generated chains, sorting and
    /// deduplicating them.
    pub fn from_chains(mut chains: Vec<RainbowChain>, params: RainbowTableParams) -> Self {
        Self::sort_and_dedup(&mut chains);
        Self { params, chains }
    }

    /// Creates a table from chains already sorted by `(endpoint, start)`
    /// and deduplicated on endpoint.
    pub(crate) fn from_sorted_chains(chains: Vec<RainbowChain>, params: RainbowTableParams) -> Self {
        debug_assert!(chains.windows(2).all(|w| w[0].endpoint < w[1].endpoint));
        Self { params, chains }
    }

    /// Sorts by `(endpoint, start)` and collapses every endpoint run to its
    /// first element, which is the chain with the smallest start.
    pub fn sort_and_dedup(chains: &mut Vec<RainbowChain>) {
        chains.sort_unstable();
        chains.dedup_by_key(|chain| chain.endpoint);
    }

    pub fn params(&self) -> &RainbowTableParams {
        &self.params
    }

    pub fn chains(&self) -> &[RainbowChain] {
        &self.chains
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Returns the chains with the given endpoint, by binary search.
    /// At most one after deduplication, but callers iterate the slice so
    /// the search is also correct on raw sorted data.
    pub fn search_endpoints(&self, endpoint: u64) -> &[RainbowChain] {
        let lo = self.chains.partition_point(|c| c.endpoint < endpoint);
        let hi = self.chains.partition_point(|c| c.endpoint <= endpoint);
        &self.chains[lo..hi]
    }

    /// Writes the table to `path` and its parameters to `path + ".params"`.
    /// Entries are little-endian `(endpoint, start)` pairs. Both files are
    /// written to a `.tmp` sibling first and renamed into place.
    pub fn save(&self, path: &Path) -> RtResult<()> {
        let mut bytes = Vec::with_capacity(self.chains.len() * 16);
        for chain in &self.chains {
            bytes.extend_from_slice(&chain.endpoint.to_le_bytes());
            bytes.extend_from_slice(&chain.startpoint.to_le_bytes());
        }

        let tmp = tmp_path(path);
        fs::write(&tmp, &bytes).map_err(|e| RtError::io("write", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| RtError::io("rename", path, e))?;

        let params_path = RainbowTableParams::sidecar_path(path);
        let params_tmp = tmp_path(&params_path);
        self.params.save_to(&params_tmp)?;
        fs::rename(&params_tmp, &params_path).map_err(|e| RtError::io("rename", &params_path, e))
    }

    /// Loads a table and its parameter sidecar from disk.
    pub fn load(path: &Path) -> RtResult<Self> {
        let params = RainbowTableParams::read_from(&RainbowTableParams::sidecar_path(path))?;
        Self::load_with_params(path, params)
    }

    /// Loads the entry file for already-read parameters.
    pub fn load_with_params(path: &Path, params: RainbowTableParams) -> RtResult<Self> {
        let bytes = fs::read(path).map_err(|e| RtError::io("read", path, e))?;
        if bytes.len() % 16 != 0 {
            return Err(RtError::TableSize {
                path: path.to_path_buf(),
                len: bytes.len() as u64,
            });
        }

        let chains = bytes
            .chunks_exact(16)
            .map(|entry| RainbowChain {
                endpoint: u64::from_le_bytes(entry[..8].try_into().unwrap()),
                startpoint: u64::from_le_bytes(entry[8..].try_into().unwrap()),
            })
            .collect();

        Ok(Self { params, chains })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::build_test_params;

    fn chain(endpoint: u64, startpoint: u64) -> RainbowChain {
        RainbowChain {
            endpoint,
            startpoint,
        }
    }

    #[test]
    fn test_sort_and_dedup_keeps_smallest_start() {
        let mut chains = vec![chain(5, 9), chain(2, 4), chain(5, 1), chain(2, 8), chain(7, 0)];
        RainbowTable::sort_and_dedup(&mut chains);

        assert_eq!(vec![chain(2, 4), chain(5, 1), chain(7, 0)], chains);
    }

    #[test]
    fn test_search_endpoints() {
        let table = RainbowTable::from_chains(
            vec![chain(3, 0), chain(9, 1), chain(12, 2)],
            build_test_params(),
        );

        assert_eq!(&[chain(9, 1)], table.search_endpoints(9));
        assert!(table.search_endpoints(4).is_empty());
        assert!(table.search_endpoints(13).is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");

        let table = RainbowTable::from_chains(
            vec![chain(3, 0), chain(1, 7), chain(3, 5), chain(0, 2)],
            build_test_params(),
        );
        table.save(&path).unwrap();

        assert_eq!(table, RainbowTable::load(&path).unwrap());

        // the entry file is bare little-endian pairs
        let bytes = fs::read(&path).unwrap();
        assert_eq!(table.len() * 16, bytes.len());
        assert_eq!(0u64, u64::from_le_bytes(bytes[..8].try_into().unwrap()));
        assert_eq!(2u64, u64::from_le_bytes(bytes[8..16].try_into().unwrap()));

        // no stray temporaries left behind
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn test_load_rejects_truncated_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");

        let table = RainbowTable::from_chains(vec![chain(3, 0)], build_test_params());
        table.save(&path).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes.pop();
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            RainbowTable::load(&path),
            Err(RtError::TableSize { .. })
        ));
    }
}
