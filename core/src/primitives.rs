//! Reusable device primitives: bitonic sort, exclusive prefix scan,
//! predicate compaction and an LSB radix sort.
//!
//! Each primitive is a small family of kernels driven from the host. The
//! kernels are generic over an element type and comparator/predicate
//! expressions, which a [`KernelSpec`] substitutes into the source as
//! `#define`s; the session's content-addressed program cache makes every
//! instantiation compile once.

use ocl::{Buffer, Kernel, OclPrm};

use crate::{
    backend::{round_to_multiple, ClSession},
    error::RtResult,
};

const BITONIC_SRC: &str = include_str!("kernels/bitonic.cl");
const SCAN_SRC: &str = include_str!("kernels/scan.cl");
const FILTER_SRC: &str = include_str!("kernels/filter.cl");
const RADIX_SRC: &str = include_str!("kernels/radix.cl");

/// Describes a primitive instantiation: the device element type, the strict
/// ordering over it, the +∞ padding literal used by the bitonic sort, and
/// the radix key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KernelSpec {
    /// OpenCL type name of the element, e.g. `ulong2`.
    pub element: &'static str,
    /// Strict-less expression over `x` and `y`.
    pub less: &'static str,
    /// An element no real element compares greater than.
    pub pad: &'static str,
    /// Sort key expression over `e`, for the radix passes.
    pub key: &'static str,
}

impl KernelSpec {
    fn defines(&self) -> String {
        format!(
            "#define T {}\n\
             #define PAD ({})\n\
             #define KEY(e) ({})\n\
             bool less(T x, T y) {{ return ({}); }}\n",
            self.element, self.pad, self.key, self.less
        )
    }
}

/// Sorts the first `len` elements of `buf` in place.
///
/// The buffer capacity must be at least `len` rounded up to a power of
/// two; the slack is filled with the padding element, which sorts last.
pub fn bitonic_sort<T: OclPrm>(
    session: &ClSession,
    buf: &Buffer<T>,
    len: usize,
    spec: &KernelSpec,
    local_size: usize,
) -> RtResult<()> {
    if len <= 1 {
        return Ok(());
    }
    let padded = len.next_power_of_two();
    assert!(padded <= buf.len());

    let defines = spec.defines();
    let program = session.program(&[&defines, BITONIC_SRC])?;

    if padded > len {
        let fill = Kernel::builder()
            .program(&program)
            .name("fill_pad")
            .queue(session.queue().clone())
            .arg(buf)
            .arg(len as u32)
            .arg(padded as u32)
            .build()?;
        session.enqueue(&fill, round_to_multiple(padded - len, local_size), local_size)?;
    }

    let cross = Kernel::builder()
        .program(&program)
        .name("bitonic_cross")
        .queue(session.queue().clone())
        .arg(buf)
        .arg(padded as u32)
        .arg_named("i", 1u32)
        .build()?;
    let inc = Kernel::builder()
        .program(&program)
        .name("bitonic_inc")
        .queue(session.queue().clone())
        .arg(buf)
        .arg(padded as u32)
        .arg_named("j", 1u32)
        .build()?;

    let pairs = round_to_multiple(padded / 2, local_size);
    let mut i = 1u32;
    while (i as usize) < padded {
        cross.set_arg("i", i)?;
        session.enqueue(&cross, pairs, local_size)?;

        let mut j = i / 2;
        while j >= 1 {
            inc.set_arg("j", j)?;
            session.enqueue(&inc, pairs, local_size)?;
            j /= 2;
        }

        i <<= 1;
    }

    session.finish()
}

/// Exclusive prefix sum over the first `len` elements of a `uint` buffer,
/// in place. Naive log-step ping-pong scan.
pub fn scan_exclusive(
    session: &ClSession,
    buf: &Buffer<u32>,
    len: usize,
    local_size: usize,
) -> RtResult<()> {
    if len == 0 {
        return Ok(());
    }

    let program = session.program(&[SCAN_SRC])?;
    let gws = round_to_multiple(len, local_size);

    let mut ping = buf.clone();
    let mut pong = session.alloc::<u32>(len)?;
    let mut in_place = true;

    let step = Kernel::builder()
        .program(&program)
        .name("scan_step")
        .queue(session.queue().clone())
        .arg_named("in", &ping)
        .arg_named("out", &pong)
        .arg(len as u32)
        .arg_named("offset", 1u32)
        .build()?;

    let mut offset = 1usize;
    while offset < len {
        step.set_arg("in", &ping)?;
        step.set_arg("out", &pong)?;
        step.set_arg("offset", offset as u32)?;
        session.enqueue(&step, gws, local_size)?;

        std::mem::swap(&mut ping, &mut pong);
        in_place = !in_place;
        offset *= 2;
    }

    // shift right by one to make the inclusive sums exclusive
    let shift = Kernel::builder()
        .program(&program)
        .name("scan_shift")
        .queue(session.queue().clone())
        .arg(&ping)
        .arg(&pong)
        .arg(len as u32)
        .build()?;
    session.enqueue(&shift, gws, local_size)?;
    std::mem::swap(&mut ping, &mut pong);
    in_place = !in_place;

    if !in_place {
        ping.copy(buf, None, Some(len)).enq()?;
    }

    session.finish()
}

/// Keeps the elements satisfying `predicate` (an expression over
/// `__global const T* ary` and the index `i`), preserving order. Returns
/// the compacted buffer and the number of survivors.
pub fn filter<T: OclPrm>(
    session: &ClSession,
    buf: &Buffer<T>,
    len: usize,
    spec: &KernelSpec,
    predicate: &str,
    local_size: usize,
) -> RtResult<(Buffer<T>, usize)> {
    let defines = format!(
        "{}bool predicate(__global const T* ary, uint i) {{ return ({predicate}); }}\n",
        spec.defines()
    );
    let program = session.program(&[&defines, FILTER_SRC])?;

    let flags = session.alloc::<u32>(len + 1)?;
    let set_flags = Kernel::builder()
        .program(&program)
        .name("set_flags")
        .queue(session.queue().clone())
        .arg(buf)
        .arg(&flags)
        .arg(len as u32)
        .build()?;
    session.enqueue(&set_flags, round_to_multiple(len + 1, local_size), local_size)?;

    scan_exclusive(session, &flags, len + 1, local_size)?;

    let mut total = [0u32];
    flags.read(&mut total[..]).offset(len).enq()?;
    let total = total[0] as usize;

    let out = session.alloc::<T>(total)?;
    if len > 0 {
        let compact = Kernel::builder()
            .program(&program)
            .name("compact")
            .queue(session.queue().clone())
            .arg(buf)
            .arg(&out)
            .arg(&flags)
            .arg(len as u32)
            .build()?;
        session.enqueue(&compact, round_to_multiple(len, local_size), local_size)?;
        session.finish()?;
    }

    Ok((out, total))
}

/// In-place [`filter`]: the survivors are copied back to the head of
/// `buf`.
pub fn filter_inplace<T: OclPrm>(
    session: &ClSession,
    buf: &Buffer<T>,
    len: usize,
    spec: &KernelSpec,
    predicate: &str,
    local_size: usize,
) -> RtResult<usize> {
    let (out, total) = filter(session, buf, len, spec, predicate, local_size)?;
    if total > 0 {
        out.copy(buf, None, Some(total)).enq()?;
        session.finish()?;
    }
    Ok(total)
}

/// Sorts the first `len` elements and collapses every run sharing a key to
/// its first element. Returns the new length.
pub fn remove_dups_inplace<T: OclPrm>(
    session: &ClSession,
    buf: &Buffer<T>,
    len: usize,
    spec: &KernelSpec,
    local_size: usize,
) -> RtResult<usize> {
    bitonic_sort(session, buf, len, spec, local_size)?;
    filter_inplace(
        session,
        buf,
        len,
        spec,
        "i == 0 || KEY(ary[i - 1]) != KEY(ary[i])",
        local_size,
    )
}

/// Stable LSB radix sort of the first `len` elements by the low `bits`
/// bits of their key.
pub fn radix_sort<T: OclPrm>(
    session: &ClSession,
    buf: &Buffer<T>,
    len: usize,
    spec: &KernelSpec,
    bits: u32,
    local_size: usize,
) -> RtResult<()> {
    if len <= 1 || bits == 0 {
        return Ok(());
    }

    let defines = spec.defines();
    let program = session.program(&[&defines, RADIX_SRC])?;

    let flags = session.alloc::<u32>(len + 1)?;
    let mut ping = buf.clone();
    let mut pong = session.alloc::<T>(len)?;
    let mut in_place = true;

    let count = Kernel::builder()
        .program(&program)
        .name("radix_flags")
        .queue(session.queue().clone())
        .arg_named("in", &ping)
        .arg(&flags)
        .arg(len as u32)
        .arg_named("bit", 0u32)
        .build()?;
    let scatter = Kernel::builder()
        .program(&program)
        .name("radix_scatter")
        .queue(session.queue().clone())
        .arg_named("in", &ping)
        .arg_named("out", &pong)
        .arg(&flags)
        .arg(len as u32)
        .arg_named("bit", 0u32)
        .arg_named("zeros", 0u32)
        .build()?;

    for bit in 0..bits {
        count.set_arg("in", &ping)?;
        count.set_arg("bit", bit)?;
        session.enqueue(&count, round_to_multiple(len + 1, local_size), local_size)?;

        scan_exclusive(session, &flags, len + 1, local_size)?;
        let mut zeros = [0u32];
        flags.read(&mut zeros[..]).offset(len).enq()?;

        scatter.set_arg("in", &ping)?;
        scatter.set_arg("out", &pong)?;
        scatter.set_arg("bit", bit)?;
        scatter.set_arg("zeros", zeros[0])?;
        session.enqueue(&scatter, round_to_multiple(len, local_size), local_size)?;

        std::mem::swap(&mut ping, &mut pong);
        in_place = !in_place;
    }

    if !in_place {
        ping.copy(buf, None, Some(len)).enq()?;
    }

    session.finish()
}
