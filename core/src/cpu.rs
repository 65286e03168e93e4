use std::collections::HashSet;

use rayon::prelude::*;
use tracing::info;

use crate::{
    chain::{chain_end, chain_end_from_hash, string_from_index, ChainIter},
    ctx::RainbowTableParams,
    error::RtResult,
    hash::{md5, Digest},
    table::{RainbowChain, RainbowTable},
};

/// The reference implementation: sequential chain math, parallelized over
/// start indices (build) and queries (lookup) with work stealing. Also used
/// to verify the device engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuEngine;

impl CpuEngine {
    pub fn new() -> Self {
        Self
    }

    /// Generates, sorts and deduplicates the chains of a table.
    pub fn build(&self, params: &RainbowTableParams) -> RtResult<RainbowTable> {
        params.validate()?;

        info!(
            chains = params.num_start_values,
            table_index = params.table_index,
            "generating chains on the CPU"
        );

        let chains: Vec<RainbowChain> = params
            .start_range()
            .into_par_iter()
            .map(|start| RainbowChain {
                endpoint: chain_end(start, 0, params.chain_len, params).0,
                startpoint: start,
            })
            .collect();

        let table = RainbowTable::from_chains(chains, params.clone());
        info!(unique_chains = table.len(), "table built");

        Ok(table)
    }

    /// Recovers a preimage index hashing to `h`, if the table covers one.
    ///
    /// Probes every start offset `k`: assumes `h` was produced at column
    /// `k`, walks the remaining rounds to an endpoint, and rebuilds any
    /// matching chain from its start to confirm the hash really occurs.
    /// Chain collisions make false endpoint matches routine; the rebuild is
    /// what rejects them.
    pub fn lookup_single(&self, table: &RainbowTable, h: &Digest) -> Option<u64> {
        let params = table.params();
        let t = params.chain_len;

        for k in 0..t {
            let endpoint = chain_end_from_hash(h, k, t, params);

            for candidate in table.search_endpoints(endpoint) {
                let hit = ChainIter::new(candidate.startpoint, params)
                    .take((k + 1) as usize)
                    .find(|(_, g)| g == h);
                if let Some((x, _)) = hit {
                    return Some(x);
                }
            }
        }

        None
    }

    /// Fan-out of [`Self::lookup_single`] over a query batch.
    pub fn lookup(&self, table: &RainbowTable, queries: &[Digest]) -> Vec<Option<u64>> {
        queries
            .par_iter()
            .map(|h| self.lookup_single(table, h))
            .collect()
    }

    /// Whether the preimage with index `x` can be recovered from the table.
    pub fn is_covered(&self, x: u64, table: &RainbowTable) -> bool {
        let h = md5(&string_from_index(x, &table.params().alphabet));
        self.lookup_single(table, &h).is_some()
    }

    /// The exact fraction of the preimage space covered by the table,
    /// measured by reconstructing every chain. Costs as much as the build.
    pub fn coverage_exact(&self, table: &RainbowTable) -> f64 {
        let covered = table
            .chains()
            .par_iter()
            .fold(HashSet::new, |mut acc, chain| {
                acc.extend(ChainIter::new(chain.startpoint, table.params()).map(|(x, _)| x));
                acc
            })
            .reduce(HashSet::new, |mut a, b| {
                a.extend(b);
                a
            });

        covered.len() as f64 / table.params().num_strings as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ctx::RainbowTableParamsBuilder, driver::sample_digests};

    fn check_table_invariants(table: &RainbowTable) {
        let params = table.params();

        // strictly sorted by endpoint, no duplicates
        assert!(table
            .chains()
            .windows(2)
            .all(|w| w[0].endpoint < w[1].endpoint));

        for chain in table.chains() {
            assert!(params.start_range().contains(&chain.startpoint));
            assert_eq!(
                chain.endpoint,
                chain_end(chain.startpoint, 0, params.chain_len, params).0,
            );
        }
    }

    /// Every index the chains pass through must be recoverable, and every
    /// recovered index must hash to the queried digest.
    fn check_covered_set(table: &RainbowTable) -> HashSet<u64> {
        let engine = CpuEngine::new();
        let params = table.params();

        let mut covered = HashSet::new();
        for chain in table.chains() {
            covered.extend(ChainIter::new(chain.startpoint, params).map(|(x, _)| x));
        }

        for &x in &covered {
            let h = md5(&string_from_index(x, &params.alphabet));
            let found = engine
                .lookup_single(table, &h)
                .expect("covered index not recovered");
            assert_eq!(h, md5(&string_from_index(found, &params.alphabet)));
        }

        covered
    }

    #[test]
    fn test_s1_two_symbol_space() {
        let params = RainbowTableParamsBuilder::new(b"ab", 2)
            .chain_len(3)
            .alpha(1.)
            .build()
            .unwrap();
        assert_eq!(7, params.num_strings);

        let engine = CpuEngine::new();
        let table = engine.build(&params).unwrap();

        check_table_invariants(&table);
        let covered = check_covered_set(&table);
        assert!(covered.iter().all(|&x| x < 7));

        // "", "a" and "b" are start indices of every maximal table and are
        // always covered
        assert_eq!(Some(0), engine.lookup_single(&table, &md5(b"")));
        assert_eq!(Some(1), engine.lookup_single(&table, &md5(b"a")));
        assert_eq!(Some(2), engine.lookup_single(&table, &md5(b"b")));

        // index 4 ("ab") may have fallen out of coverage; when found the
        // result must hash back to the query
        if let Some(x) = engine.lookup_single(&table, &md5(b"ab")) {
            assert_eq!(md5(b"ab"), md5(&string_from_index(x, &params.alphabet)));
        } else {
            assert!(!covered.contains(&4));
        }
    }

    #[test]
    fn test_s2_sampled_coverage_matches_exact() {
        let params = RainbowTableParamsBuilder::new(b"0123456789", 4)
            .chain_len(100)
            .alpha(0.5)
            .build()
            .unwrap();

        let engine = CpuEngine::new();
        let table = engine.build(&params).unwrap();
        check_table_invariants(&table);

        let exact = engine.coverage_exact(&table);

        let samples = sample_digests(&params, 1000, 0);
        let found = samples
            .par_iter()
            .filter(|(_, h)| engine.lookup_single(&table, h).is_some())
            .count();
        let sampled = found as f64 / samples.len() as f64;

        // ~3.5σ of the binomial bound at n = 1000
        assert!(
            (sampled - exact).abs() < 0.04,
            "sampled coverage {sampled} too far from exact coverage {exact}"
        );
    }

    #[test]
    fn test_s4_unary_alphabet_full_coverage() {
        let params = RainbowTableParamsBuilder::new(b"a", 5)
            .chain_len(10)
            .alpha(1.)
            .build()
            .unwrap();
        assert_eq!(6, params.num_strings);
        assert_eq!(6, params.num_start_values);

        let engine = CpuEngine::new();
        let table = engine.build(&params).unwrap();
        check_table_invariants(&table);

        // all preimages are distinct by length, every lookup succeeds
        for x in 0..6 {
            let h = md5(&string_from_index(x, &params.alphabet));
            assert_eq!(Some(x), engine.lookup_single(&table, &h));
        }
    }

    #[test]
    fn test_s5_save_load_round_trip() {
        let params = RainbowTableParamsBuilder::new(b"0123456789", 4)
            .chain_len(100)
            .alpha(0.5)
            .build()
            .unwrap();
        let table = CpuEngine::new().build(&params).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s2-table");
        table.save(&path).unwrap();

        let reloaded = RainbowTable::load(&path).unwrap();
        assert_eq!(table, reloaded);

        // a second save of the reloaded table is byte-identical
        let copy = dir.path().join("s2-table-copy");
        reloaded.save(&copy).unwrap();
        assert_eq!(
            std::fs::read(&path).unwrap(),
            std::fs::read(&copy).unwrap()
        );
        assert_eq!(
            std::fs::read(RainbowTableParams::sidecar_path(&path)).unwrap(),
            std::fs::read(RainbowTableParams::sidecar_path(&copy)).unwrap()
        );
    }

    #[test]
    fn test_s6_collision_heavy_space() {
        // a tiny space with long chains forces endpoint collisions
        let params = RainbowTableParamsBuilder::new(b"abc", 2)
            .chain_len(50)
            .alpha(1.)
            .build()
            .unwrap();
        assert_eq!(13, params.num_strings);

        let table = CpuEngine::new().build(&params).unwrap();
        assert!(table.len() < 13, "expected merged chains in this space");

        check_table_invariants(&table);
        check_covered_set(&table);
    }

    #[test]
    fn test_lookup_misses_report_none() {
        // a single-chain table leaves most of the space uncovered
        let params = RainbowTableParamsBuilder::new(b"0123456789", 3)
            .chain_len(5)
            .start_values(Some(1))
            .build()
            .unwrap();

        let engine = CpuEngine::new();
        let table = engine.build(&params).unwrap();

        let results = engine.lookup(
            &table,
            &[md5(b"0"), md5(b"not even in the space"), md5(b"999")],
        );
        assert_eq!(3, results.len());
        assert!(results[1].is_none());
    }
}
