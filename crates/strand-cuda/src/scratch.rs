// Scratch: Per-device staging area for kernel argument tables
//
// The batch sum takes any number of operands and reads their pointers and
// leading dimensions from a small device buffer. Allocating one per launch
// would put a cudaMalloc on every gradient reduction, so each device keeps a
// single buffer that only ever grows.
//
// The buffer is shared by every stream on the device. A table upload must not
// overwrite the previous table while a kernel may still read it, so every
// launch that used the buffer records an event, and the next upload (on any
// stream) waits on that event on the GPU. The host never blocks except when
// the buffer grows: the old buffer is only freed after the device drains.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::{result, sys, CudaSlice, DevicePtr, DeviceSlice};
use strand_core::{Error, Result};

/// Snapshot of the scratch buffer's state.
#[derive(Debug, Clone, Copy)]
pub struct ScratchStats {
    /// Capacity in 64-bit words.
    pub capacity: usize,
    /// How many times the buffer was reallocated to grow.
    pub grows: u64,
}

struct Slot {
    buf: Option<CudaSlice<u64>>,
    // recorded after the last launch that read `buf`
    done: Option<sys::CUevent>,
    armed: bool,
}

// Safety: the event handle is only touched under the mutex
unsafe impl Send for Slot {}

/// Grow-only device buffer for argument tables.
pub struct Scratch {
    slot: Mutex<Slot>,
    grows: AtomicU64,
}

/// Exclusive use of the scratch buffer until retired or dropped.
pub struct ScratchLease<'a> {
    guard: MutexGuard<'a, Slot>,
    ptr: u64,
}

impl ScratchLease<'_> {
    /// Device address of the staged table.
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Mark the table as in use until the work queued so far on `stream`
    /// has run.
    pub fn retire(mut self, stream: &cudarc::driver::CudaStream) -> Result<()> {
        let event = match self.guard.done {
            Some(event) => event,
            None => {
                let event = result::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
                    .map_err(|e| Error::backend(format!("scratch event: {e}")))?;
                self.guard.done = Some(event);
                event
            }
        };
        unsafe { result::event::record(event, stream.stream) }
            .map_err(|e| Error::backend(format!("scratch event record: {e}")))?;
        self.guard.armed = true;
        Ok(())
    }
}

impl Default for Scratch {
    fn default() -> Self {
        Self::new()
    }
}

impl Scratch {
    pub fn new() -> Self {
        Scratch {
            slot: Mutex::new(Slot {
                buf: None,
                done: None,
                armed: false,
            }),
            grows: AtomicU64::new(0),
        }
    }

    /// Upload `words` on `stream`, growing the buffer first if needed.
    ///
    /// The upload is queued behind the last launch that used the buffer.
    pub fn stage(
        &self,
        dev: &Arc<cudarc::driver::CudaDevice>,
        stream: &cudarc::driver::CudaStream,
        words: &[u64],
    ) -> Result<ScratchLease<'_>> {
        let mut guard = self
            .slot
            .lock()
            .map_err(|_| Error::backend("scratch lock poisoned"))?;

        let capacity = guard.buf.as_ref().map_or(0, |buf| buf.len());
        if capacity < words.len() {
            let new_capacity = words.len().next_power_of_two().max(64);
            if guard.armed {
                // a kernel may still read the old buffer
                dev.synchronize()
                    .map_err(|e| Error::backend(format!("scratch drain: {e}")))?;
                guard.armed = false;
            }
            let buf = unsafe { dev.alloc::<u64>(new_capacity) }.map_err(|e| Error::Allocation {
                bytes: new_capacity * 8,
                device: dev.ordinal(),
                reason: e.to_string(),
            })?;
            log::debug!(
                "scratch on cuda:{} grew from {capacity} to {new_capacity} words",
                dev.ordinal()
            );
            self.grows.fetch_add(1, Ordering::Relaxed);
            guard.buf = Some(buf);
        }

        if let (true, Some(event)) = (guard.armed, guard.done) {
            unsafe {
                result::stream::wait_event(
                    stream.stream,
                    event,
                    sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
                )
            }
            .map_err(|e| Error::backend(format!("scratch wait: {e}")))?;
        }

        let ptr = match guard.buf.as_ref() {
            Some(buf) => *buf.device_ptr(),
            None => return Err(Error::backend("scratch buffer missing after growth")),
        };
        unsafe { result::memcpy_htod_async(ptr, words, stream.stream) }
            .map_err(|e| Error::backend(format!("scratch upload: {e}")))?;
        Ok(ScratchLease { guard, ptr })
    }

    pub fn stats(&self) -> ScratchStats {
        let capacity = self
            .slot
            .lock()
            .map(|g| g.buf.as_ref().map_or(0, |buf| buf.len()))
            .unwrap_or(0);
        ScratchStats {
            capacity,
            grows: self.grows.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Ok(slot) = self.slot.get_mut() {
            if let Some(event) = slot.done.take() {
                // the buffer is freed right after, which waits for its readers
                let _ = unsafe { result::event::destroy(event) };
            }
        }
    }
}
