use std::{
    thread,
    time::{Duration, Instant},
};

use ocl::{prm::Uint4, Buffer, Kernel, Program};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    backend::{round_to_multiple, ClSession},
    chain::{chain_end, chain_end_from_hash},
    cpu::CpuEngine,
    ctx::RainbowTableParams,
    error::{RtError, RtResult},
    hash::Digest,
    primitives::{radix_sort, remove_dups_inplace, KernelSpec},
    table::{RainbowChain, RainbowTable},
    NOT_FOUND,
};

const MD5_SRC: &str = include_str!("kernels/md5.cl");
const CHAINS_SRC: &str = include_str!("kernels/chains.cl");

/// Below this many lookup records the host sorts them itself; above, the
/// device radix sort wins.
const RADIX_SORT_THRESHOLD: usize = 1 << 16;

/// Chain entries: sorted by endpoint, ties by start.
pub(crate) const CHAIN_SPEC: KernelSpec = KernelSpec {
    element: "ulong2",
    less: "(x).x < (y).x || ((x).x == (y).x && (x).y < (y).y)",
    pad: "(ulong2)(ULONG_MAX, ULONG_MAX)",
    key: "(e).x",
};

/// Lookup fan-out records `(endpoint, column, query, 0)`, keyed by
/// endpoint.
const LOOKUP_SPEC: KernelSpec = KernelSpec {
    element: "ulong4",
    less: "(x).x < (y).x || ((x).x == (y).x && ((x).y < (y).y || ((x).y == (y).y && (x).z < (y).z)))",
    pad: "(ulong4)(ULONG_MAX, ULONG_MAX, ULONG_MAX, ULONG_MAX)",
    key: "(e).x",
};

/// One `(endpoint, column, query)` fan-out record of a batched lookup.
/// Layout matches a device `ulong4`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
struct LookupRecord {
    endpoint: u64,
    column: u64,
    query: u64,
    pad: u64,
}

unsafe impl ocl::OclPrm for LookupRecord {}

/// Dispatch geometry of the device engine. Explicit configuration, passed
/// at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuConfig {
    /// Work-group size. Dispatches are rounded up to a multiple of it.
    pub local_size: usize,
    /// Work items per dispatch.
    pub global_size: usize,
    /// Dispatches worth of chains batched between host round-trips during
    /// a build.
    pub block_size: usize,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            local_size: 1 << 8,
            global_size: 1 << 17,
            block_size: 1,
        }
    }
}

/// The OpenCL implementation of table builds and lookups.
pub struct GpuEngine {
    session: ClSession,
    config: GpuConfig,
    verify: bool,
    cpu: CpuEngine,
}

impl GpuEngine {
    /// Opens a device session. With `verify` set, every device result is
    /// recomputed on the CPU engine and mismatches are fatal.
    pub fn new(config: GpuConfig, verify: bool) -> RtResult<Self> {
        Ok(Self {
            session: ClSession::new()?,
            config,
            verify,
            cpu: CpuEngine::new(),
        })
    }

    fn chains_program(&self) -> RtResult<Program> {
        self.session.program(&[MD5_SRC, CHAINS_SRC])
    }

    fn alphabet_buf(&self, params: &RainbowTableParams) -> RtResult<Buffer<u8>> {
        let buf = self.session.alloc(params.alphabet.len())?;
        self.session.write(&buf, &params.alphabet)?;
        Ok(buf)
    }

    /// Builds a table with chunked dispatches into a growing device
    /// buffer, compacting duplicates as the buffer fills.
    pub fn build(&mut self, params: &RainbowTableParams) -> RtResult<RainbowTable> {
        params.validate()?;

        let range = params.start_range();
        let chunk = (self.config.block_size * self.config.global_size) as u64;
        let program = self.chains_program()?;
        let alphabet_buf = self.alphabet_buf(params)?;

        let mut capacity = (chunk.min(params.num_start_values) as usize).next_power_of_two();
        let mut chain_buf: Buffer<RainbowChain> = self.session.alloc(capacity)?;

        let kernel = Kernel::builder()
            .program(&program)
            .name("generate_chains")
            .queue(self.session.queue().clone())
            .arg_named("start", 0u64)
            .arg(range.end)
            .arg(params.num_strings)
            .arg(params.chain_len)
            .arg(params.table_shift())
            .arg(&alphabet_buf)
            .arg(params.alphabet.len() as u32)
            .arg_named("chains", &chain_buf)
            .arg_named("slot", 0u64)
            .build()?;

        info!(
            chains = params.num_start_values,
            table_index = params.table_index,
            "generating chains on the device"
        );

        let mut total: u64 = 0;
        let mut last_compaction: u64 = 0;
        let mut realloc_time = Duration::ZERO;

        let mut offset = range.start;
        while offset < range.end {
            let count = chunk.min(range.end - offset);

            if total + count > capacity as u64 {
                let grow_start = Instant::now();
                let new_capacity =
                    (capacity * 2).max(((total + count) as usize).next_power_of_two());
                let new_buf = self.session.alloc(new_capacity)?;
                if total > 0 {
                    chain_buf.copy(&new_buf, None, Some(total as usize)).enq()?;
                }
                self.session.finish()?;
                chain_buf = new_buf;
                capacity = new_capacity;
                kernel.set_arg("chains", &chain_buf)?;
                realloc_time += grow_start.elapsed();
            }

            kernel.set_arg("start", offset)?;
            kernel.set_arg("slot", total)?;
            let gws = round_to_multiple(count as usize, self.config.local_size);
            self.session.enqueue(&kernel, gws, self.config.local_size)?;
            self.session.finish()?;

            total += count;
            offset += count;
            debug!(
                progress = 100. * (offset - range.start) as f64 / params.num_start_values as f64,
                "chunk done"
            );

            let final_chunk = offset >= range.end;
            if total > 2 * last_compaction || final_chunk {
                total = remove_dups_inplace(
                    &self.session,
                    &chain_buf,
                    total as usize,
                    &CHAIN_SPEC,
                    self.config.local_size,
                )? as u64;
                last_compaction = total;
                debug!(unique_chains = total, "compacted chains");
            }

            // keep the device responsive to the rest of the system
            thread::sleep(Duration::from_micros(500));
        }

        debug!(?realloc_time, "time spent growing the chain buffer");

        let mut chains = vec![RainbowChain::default(); total as usize];
        self.session.read(&chain_buf, &mut chains)?;

        if self.verify {
            self.verify_chains(&chains, params)?;
        }

        info!(unique_chains = chains.len(), "table built");
        Ok(RainbowTable::from_sorted_chains(chains, params.clone()))
    }

    fn verify_chains(&self, chains: &[RainbowChain], params: &RainbowTableParams) -> RtResult<()> {
        let mismatch = chains.par_iter().find_map_any(|chain| {
            let host = chain_end(chain.startpoint, 0, params.chain_len, params).0;
            (host != chain.endpoint).then_some(RtError::Verification {
                from: chain.startpoint,
                device: chain.endpoint,
                host,
            })
        });

        match mismatch {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Looks up a query batch: computes the `t·Q` candidate endpoints on
    /// the device, sorts them against the table order, and probes the
    /// table with a binary search per record.
    pub fn lookup(
        &mut self,
        table: &RainbowTable,
        queries: &[Digest],
    ) -> RtResult<Vec<Option<u64>>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let params = table.params();
        let num_queries = queries.len() as u64;
        let records = params.chain_len * num_queries;

        let program = self.chains_program()?;
        let alphabet_buf = self.alphabet_buf(params)?;

        let query_words: Vec<Uint4> = queries
            .iter()
            .map(|h| {
                Uint4::new(
                    u32::from_le_bytes(h[0..4].try_into().unwrap()),
                    u32::from_le_bytes(h[4..8].try_into().unwrap()),
                    u32::from_le_bytes(h[8..12].try_into().unwrap()),
                    u32::from_le_bytes(h[12..16].try_into().unwrap()),
                )
            })
            .collect();
        let query_buf: Buffer<Uint4> = self.session.alloc(queries.len())?;
        self.session.write(&query_buf, &query_words)?;

        let record_buf: Buffer<LookupRecord> = self.session.alloc(records as usize)?;

        // one record per (column, query) pair
        let compute = Kernel::builder()
            .program(&program)
            .name("compute_endpoints")
            .queue(self.session.queue().clone())
            .arg_named("offset", 0u64)
            .arg(records)
            .arg(params.num_strings)
            .arg(params.chain_len)
            .arg(params.table_shift())
            .arg(&alphabet_buf)
            .arg(params.alphabet.len() as u32)
            .arg(&query_buf)
            .arg(num_queries)
            .arg(&record_buf)
            .build()?;
        self.dispatch_chunks(&compute, records)?;

        if self.verify {
            self.verify_endpoints(&record_buf, queries, params)?;
        }

        self.sort_records(&record_buf, records as usize, params)?;

        let result_buf: Buffer<u64> = self.session.alloc(queries.len())?;
        let fill = Kernel::builder()
            .program(&program)
            .name("fill_ulong")
            .queue(self.session.queue().clone())
            .arg(&result_buf)
            .arg(queries.len() as u64)
            .arg(NOT_FOUND)
            .build()?;
        self.session.enqueue(
            &fill,
            round_to_multiple(queries.len(), self.config.local_size),
            self.config.local_size,
        )?;

        let table_buf: Buffer<RainbowChain> = self.session.alloc(table.len())?;
        self.session.write(&table_buf, table.chains())?;

        let probe = Kernel::builder()
            .program(&program)
            .name("lookup_endpoints")
            .queue(self.session.queue().clone())
            .arg_named("offset", 0u64)
            .arg(records)
            .arg(params.num_strings)
            .arg(params.chain_len)
            .arg(params.table_shift())
            .arg(&alphabet_buf)
            .arg(params.alphabet.len() as u32)
            .arg(&query_buf)
            .arg(&record_buf)
            .arg(&result_buf)
            .arg(&table_buf)
            .arg(table.len() as u64)
            .build()?;
        self.dispatch_chunks(&probe, records)?;

        let mut raw = vec![0u64; queries.len()];
        self.session.read(&result_buf, &mut raw)?;

        if self.verify {
            self.verify_results(&raw, table, queries)?;
        }

        Ok(raw
            .into_iter()
            .map(|x| (x != NOT_FOUND).then_some(x))
            .collect())
    }

    /// Runs a kernel over `[0, hi)` in dispatches of `global_size` items.
    fn dispatch_chunks(&self, kernel: &Kernel, hi: u64) -> RtResult<()> {
        let mut offset = 0u64;
        while offset < hi {
            let count = (self.config.global_size as u64).min(hi - offset);
            kernel.set_arg("offset", offset)?;
            let gws = round_to_multiple(count as usize, self.config.local_size);
            self.session.enqueue(kernel, gws, self.config.local_size)?;
            self.session.finish()?;
            offset += count;
        }
        Ok(())
    }

    /// Sorts the fan-out records by endpoint so that neighbouring work
    /// items probe neighbouring table regions. Ties stay in (column,
    /// query) order either way.
    fn sort_records(
        &self,
        record_buf: &Buffer<LookupRecord>,
        len: usize,
        params: &RainbowTableParams,
    ) -> RtResult<()> {
        if len >= RADIX_SORT_THRESHOLD {
            let bits = 64 - (params.num_strings - 1).leading_zeros();
            radix_sort(
                &self.session,
                record_buf,
                len,
                &LOOKUP_SPEC,
                bits,
                self.config.local_size,
            )
        } else {
            let mut records = vec![LookupRecord::default(); len];
            self.session.read(record_buf, &mut records)?;
            records.sort_unstable();
            self.session.write(record_buf, &records)
        }
    }

    fn verify_endpoints(
        &self,
        record_buf: &Buffer<LookupRecord>,
        queries: &[Digest],
        params: &RainbowTableParams,
    ) -> RtResult<()> {
        let mut records = vec![LookupRecord::default(); params.chain_len as usize * queries.len()];
        self.session.read(record_buf, &mut records)?;

        let num_queries = queries.len() as u64;
        let mismatch = records.par_iter().enumerate().find_map_any(|(i, record)| {
            let column = i as u64 / num_queries;
            let query = i as u64 % num_queries;
            debug_assert_eq!((column, query), (record.column, record.query));

            let host = chain_end_from_hash(
                &queries[query as usize],
                column,
                params.chain_len,
                params,
            );
            (host != record.endpoint).then_some(RtError::Verification {
                from: query,
                device: record.endpoint,
                host,
            })
        });

        match mismatch {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn verify_results(
        &self,
        raw: &[u64],
        table: &RainbowTable,
        queries: &[Digest],
    ) -> RtResult<()> {
        for (i, (&device, h)) in raw.iter().zip(queries).enumerate() {
            let host = self
                .cpu
                .lookup_single(table, h)
                .unwrap_or(NOT_FOUND);
            if host != device {
                return Err(RtError::LookupVerification {
                    query: i,
                    device,
                    host,
                });
            }
        }
        Ok(())
    }
}
