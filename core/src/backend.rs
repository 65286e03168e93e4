use std::{
    cell::RefCell,
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
};

use ocl::{Buffer, Context, Device, Kernel, OclPrm, Platform, Program, Queue};
use tracing::{debug, info};

use crate::error::{RtError, RtResult};

/// An OpenCL session: one device, one in-order queue, and a
/// content-addressed cache of compiled programs.
///
/// The session is the thin device surface everything else is written
/// against: allocate a buffer, write it, read it, enqueue a kernel with a
/// work-group shape, and wait for the queue. Buffers and kernels created
/// through a session must not outlive it.
pub struct ClSession {
    device: Device,
    context: Context,
    queue: Queue,
    programs: RefCell<HashMap<u64, Program>>,
}

impl ClSession {
    /// Opens a session on the first device of the first platform.
    pub fn new() -> RtResult<Self> {
        let platform = Platform::list()
            .into_iter()
            .next()
            .ok_or_else(|| RtError::Backend("no OpenCL platform available".into()))?;
        let device = Device::first(platform)?;

        let context = Context::builder()
            .platform(platform)
            .devices(device)
            .build()?;
        let queue = Queue::new(&context, device, None)?;

        info!(device = %device.name()?, "opened OpenCL session");

        Ok(Self {
            device,
            context,
            queue,
            programs: RefCell::new(HashMap::new()),
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Allocates an uninitialized device buffer of `len` elements.
    pub fn alloc<T: OclPrm>(&self, len: usize) -> RtResult<Buffer<T>> {
        Ok(Buffer::builder()
            .queue(self.queue.clone())
            .len(len.max(1))
            .build()?)
    }

    /// Writes host data into the head of a device buffer.
    pub fn write<T: OclPrm>(&self, buf: &Buffer<T>, data: &[T]) -> RtResult<()> {
        if !data.is_empty() {
            buf.write(data).enq()?;
        }
        Ok(())
    }

    /// Reads the head of a device buffer into a host slice, blocking.
    pub fn read<T: OclPrm>(&self, buf: &Buffer<T>, out: &mut [T]) -> RtResult<()> {
        if !out.is_empty() {
            buf.read(out).enq()?;
        }
        Ok(())
    }

    /// Enqueues a kernel with the given work-group shape.
    pub fn enqueue(&self, kernel: &Kernel, global: usize, local: usize) -> RtResult<()> {
        unsafe {
            kernel
                .cmd()
                .global_work_size(global)
                .local_work_size(local)
                .enq()?;
        }
        Ok(())
    }

    /// Blocks until every enqueued command has completed.
    pub fn finish(&self) -> RtResult<()> {
        self.queue.finish()?;
        Ok(())
    }

    /// Builds a program from the given source fragments, or returns the
    /// cached build. The cache key is the content of the concatenated
    /// fragments, so a primitive instantiated twice with the same element
    /// type and expressions compiles once.
    pub fn program(&self, sources: &[&str]) -> RtResult<Program> {
        let mut hasher = DefaultHasher::new();
        sources.hash(&mut hasher);
        let key = hasher.finish();

        if let Some(program) = self.programs.borrow().get(&key) {
            return Ok(program.clone());
        }

        debug!(fragments = sources.len(), "compiling device program");
        let mut builder = Program::builder();
        for src in sources {
            builder.src(*src);
        }
        // on compile failure the ocl error carries the build log
        let program = builder.devices(self.device).build(&self.context)?;

        self.programs
            .borrow_mut()
            .insert(key, program.clone());
        Ok(program)
    }
}

/// Rounds `n` up to a multiple of the work-group size.
pub(crate) fn round_to_multiple(n: usize, multiple: usize) -> usize {
    n.div_ceil(multiple) * multiple
}
