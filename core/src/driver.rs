use std::path::Path;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

#[cfg(feature = "opencl")]
use crate::gpu::{GpuConfig, GpuEngine};
use crate::{
    chain::string_from_index,
    cpu::CpuEngine,
    ctx::RainbowTableParams,
    error::{RtError, RtResult},
    hash::{md5, Digest},
    table::RainbowTable,
};

/// A table build/lookup implementation. The CPU and device engines expose
/// the same surface so the driver and the front-end don't care which one
/// they run on.
pub trait Engine {
    fn build(&mut self, params: &RainbowTableParams) -> RtResult<RainbowTable>;
    fn lookup(&mut self, table: &RainbowTable, queries: &[Digest]) -> RtResult<Vec<Option<u64>>>;
}

impl Engine for CpuEngine {
    fn build(&mut self, params: &RainbowTableParams) -> RtResult<RainbowTable> {
        CpuEngine::build(self, params)
    }

    fn lookup(&mut self, table: &RainbowTable, queries: &[Digest]) -> RtResult<Vec<Option<u64>>> {
        Ok(CpuEngine::lookup(self, table, queries))
    }
}

#[cfg(feature = "opencl")]
impl Engine for GpuEngine {
    fn build(&mut self, params: &RainbowTableParams) -> RtResult<RainbowTable> {
        GpuEngine::build(self, params)
    }

    fn lookup(&mut self, table: &RainbowTable, queries: &[Digest]) -> RtResult<Vec<Option<u64>>> {
        GpuEngine::lookup(self, table, queries)
    }
}

/// Compute backend selection.
#[derive(Clone, Debug, Default)]
pub enum Backend {
    #[default]
    Cpu,
    #[cfg(feature = "opencl")]
    OpenCl {
        config: GpuConfig,
        /// Cross-check every device result on the CPU engine.
        verify: bool,
    },
}

impl Backend {
    pub fn engine(&self) -> RtResult<Box<dyn Engine>> {
        match self {
            Backend::Cpu => Ok(Box::new(CpuEngine::new())),
            #[cfg(feature = "opencl")]
            Backend::OpenCl { config, verify } => {
                Ok(Box::new(GpuEngine::new(config.clone(), *verify)?))
            }
        }
    }
}

/// Builds a table on the selected backend.
pub fn build_table(params: &RainbowTableParams, backend: &Backend) -> RtResult<RainbowTable> {
    backend.engine()?.build(params)
}

/// Looks queries up across a set of tables, narrowing the unresolved set
/// between tables.
///
/// All tables must agree on the alphabet and the space size; a preimage
/// index is only meaningful against the space it was built over.
pub fn lookup_tables<P: AsRef<Path>>(
    paths: &[P],
    queries: &[Digest],
    backend: &Backend,
) -> RtResult<Vec<Option<u64>>> {
    let mut results: Vec<Option<u64>> = vec![None; queries.len()];
    if paths.is_empty() || queries.is_empty() {
        return Ok(results);
    }

    let mut engine = backend.engine()?;
    let mut live: Vec<usize> = (0..queries.len()).collect();
    let mut live_queries: Vec<Digest> = queries.to_vec();
    let mut reference: Option<(u64, Vec<u8>)> = None;

    for path in paths {
        if live.is_empty() {
            break;
        }
        let path = path.as_ref();

        let params = RainbowTableParams::read_from(&RainbowTableParams::sidecar_path(path))?;
        match &reference {
            None => reference = Some((params.num_strings, params.alphabet.clone())),
            Some((num_strings, alphabet))
                if (*num_strings, alphabet.as_slice())
                    != (params.num_strings, params.alphabet.as_slice()) =>
            {
                return Err(RtError::TableMismatch);
            }
            Some(_) => {}
        }

        let table = RainbowTable::load_with_params(path, params)?;
        info!(
            table = %path.display(),
            chains = table.len(),
            queries = live.len(),
            "searching table"
        );

        let table_results = engine.lookup(&table, &live_queries)?;

        let mut next_live = Vec::new();
        let mut next_queries = Vec::new();
        for ((&index, &query), result) in live.iter().zip(&live_queries).zip(table_results) {
            match result {
                Some(preimage) => results[index] = Some(preimage),
                None => {
                    next_live.push(index);
                    next_queries.push(query);
                }
            }
        }
        live = next_live;
        live_queries = next_queries;

        info!(
            resolved = queries.len() - live.len(),
            total = queries.len(),
            "coverage so far"
        );
    }

    Ok(results)
}

/// Draws `count` uniform preimage indices with a seeded generator and
/// hashes them. Used to estimate table coverage.
pub fn sample_digests(
    params: &RainbowTableParams,
    count: usize,
    seed: u64,
) -> Vec<(u64, Digest)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let x = rng.gen_range(0..params.num_strings);
            (x, md5(&string_from_index(x, &params.alphabet)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::RainbowTableParamsBuilder;
    use std::path::PathBuf;

    fn sibling_params(table_index: u64) -> RainbowTableParams {
        RainbowTableParamsBuilder::new(b"0123456789", 4)
            .chain_len(100)
            .alpha(0.5)
            .table_index(table_index)
            .build()
            .unwrap()
    }

    fn build_and_save(params: &RainbowTableParams, dir: &Path) -> PathBuf {
        let path = dir.join(format!("table_{}", params.table_index));
        CpuEngine::new()
            .build(params)
            .unwrap()
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn test_s3_sibling_tables_increase_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = build_and_save(&sibling_params(0), dir.path());
        let t1 = build_and_save(&sibling_params(1), dir.path());

        let queries: Vec<Digest> = sample_digests(&sibling_params(0), 1000, 0)
            .into_iter()
            .map(|(_, h)| h)
            .collect();

        let resolved = |results: &[Option<u64>]| results.iter().filter(|r| r.is_some()).count();

        let first = lookup_tables(&[&t0], &queries, &Backend::Cpu).unwrap();
        let second = lookup_tables(&[&t1], &queries, &Backend::Cpu).unwrap();
        let both = lookup_tables(&[&t0, &t1], &queries, &Backend::Cpu).unwrap();

        // the pair covers at least what each table covers alone
        assert!(resolved(&both) >= resolved(&first));
        assert!(resolved(&both) >= resolved(&second));

        // adding a table never drops a resolved query
        for (one, pair) in first.iter().zip(&both) {
            if one.is_some() {
                assert!(pair.is_some());
            }
        }
    }

    #[test]
    fn test_rejects_mismatched_tables() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = build_and_save(&sibling_params(0), dir.path());

        let other = RainbowTableParamsBuilder::new(b"abcdef", 3)
            .chain_len(10)
            .alpha(0.5)
            .build()
            .unwrap();
        let t1 = dir.path().join("other");
        CpuEngine::new().build(&other).unwrap().save(&t1).unwrap();

        let result = lookup_tables(&[&t0, &t1], &[md5(b"0")], &Backend::Cpu);
        assert!(matches!(result, Err(RtError::TableMismatch)));
    }

    #[test]
    fn test_empty_inputs() {
        let no_paths: [&Path; 0] = [];
        assert_eq!(
            Vec::<Option<u64>>::new(),
            lookup_tables(&no_paths, &[], &Backend::Cpu).unwrap()
        );
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let params = sibling_params(0);
        assert_eq!(
            sample_digests(&params, 50, 42),
            sample_digests(&params, 50, 42)
        );
        assert_ne!(
            sample_digests(&params, 50, 42),
            sample_digests(&params, 50, 43)
        );
    }
}
