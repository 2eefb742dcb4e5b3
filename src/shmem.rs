//! Named shared-memory pool carrying script bodies between the master's
//! writer side and the worker's executor side.
//!
//! The region is split into fixed slots of [`SHMEM_BLOCK_SIZE`] bytes; a
//! job's slot index is its id modulo the slot count, and both peers derive
//! it the same way. There is no in-band locking: the writer takes a
//! [`SlotLease`] before the job is pushed, writes once, and the lease is
//! only released on the job's terminal outcome, so a slot is never
//! rewritten while tasks referencing it are in flight.

use std::collections::HashMap;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{PrexdError, Result};

pub const SHMEM_NAME: &str = "prexec_shmem";
pub const SHMEM_BLOCK_SIZE: usize = 512 * 1024;
pub const MAX_SCRIPT_SIZE: usize = SHMEM_BLOCK_SIZE - 1;

/// One mapped shared-memory region, writer or reader side.
pub struct ShmemPool {
    ptr: NonNull<c_void>,
    len: usize,
    slots: usize,
    name: String,
    /// The creating side unlinks the object on drop.
    owner: bool,
    _fd: OwnedFd,
    leases: Mutex<HashMap<usize, i64>>,
}

// The raw pointer is only dereferenced through the slot accessors, whose
// exclusivity is guaranteed by the lease protocol.
unsafe impl Send for ShmemPool {}
unsafe impl Sync for ShmemPool {}

impl ShmemPool {
    /// Create and map the region read-write (the master's writer side).
    pub fn create(name: &str, slots: usize) -> Result<Arc<Self>> {
        let len = slots * SHMEM_BLOCK_SIZE;
        // A stale object from a crashed run would otherwise keep its old size.
        let _ = shm_unlink(name);
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        ftruncate(&fd, len as i64)?;
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).ok_or(PrexdError::Config("zero shmem slots".into()))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        Ok(Arc::new(Self {
            ptr,
            len,
            slots,
            name: name.to_string(),
            owner: true,
            _fd: fd,
            leases: Mutex::new(HashMap::new()),
        }))
    }

    /// Map an existing region read-only (the worker's executor side).
    pub fn open(name: &str, slots: usize) -> Result<Arc<Self>> {
        let len = slots * SHMEM_BLOCK_SIZE;
        let fd = shm_open(name, OFlag::O_RDONLY, Mode::empty())?;
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).ok_or(PrexdError::Config("zero shmem slots".into()))?,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )?
        };
        Ok(Arc::new(Self {
            ptr,
            len,
            slots,
            name: name.to_string(),
            owner: false,
            _fd: fd,
            leases: Mutex::new(HashMap::new()),
        }))
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn slot_index(&self, job_id: i64) -> usize {
        (job_id.unsigned_abs() as usize) % self.slots
    }

    /// Take exclusive ownership of the slot for `job_id` and write the
    /// script into it. Fails when another live job maps to the same slot.
    pub fn lease(self: &Arc<Self>, job_id: i64, script: &[u8]) -> Result<SlotLease> {
        if script.len() > MAX_SCRIPT_SIZE {
            return Err(PrexdError::ScriptTooLarge(script.len()));
        }
        let index = self.slot_index(job_id);
        {
            let mut leases = self.leases.lock().expect("shmem lease lock poisoned");
            if let Some(&holder) = leases.get(&index) {
                if holder != job_id {
                    return Err(PrexdError::NoFreeSlot(job_id));
                }
            }
            leases.insert(index, job_id);
        }
        self.write_slot(index, script);
        Ok(SlotLease {
            pool: Arc::clone(self),
            index,
            job_id,
        })
    }

    fn write_slot(&self, index: usize, data: &[u8]) {
        debug_assert!(index < self.slots && data.len() <= SHMEM_BLOCK_SIZE);
        let offset = index * SHMEM_BLOCK_SIZE;
        unsafe {
            let dst = (self.ptr.as_ptr() as *mut u8).add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    /// Copy `len` script bytes out of the slot for `job_id`.
    pub fn read_slot(&self, job_id: i64, len: usize) -> Result<Vec<u8>> {
        if len > MAX_SCRIPT_SIZE {
            return Err(PrexdError::ScriptTooLarge(len));
        }
        let offset = self.slot_index(job_id) * SHMEM_BLOCK_SIZE;
        let mut out = vec![0u8; len];
        unsafe {
            let src = (self.ptr.as_ptr() as *const u8).add(offset);
            std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn release(&self, index: usize, job_id: i64) {
        let mut leases = self.leases.lock().expect("shmem lease lock poisoned");
        if leases.get(&index) == Some(&job_id) {
            leases.remove(&index);
        }
    }
}

impl Drop for ShmemPool {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
        if self.owner {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

impl std::fmt::Debug for ShmemPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemPool")
            .field("name", &self.name)
            .field("slots", &self.slots)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Exclusive ownership of one slot for the lifetime of a job.
#[derive(Debug)]
pub struct SlotLease {
    pool: Arc<ShmemPool>,
    index: usize,
    job_id: i64,
}

impl SlotLease {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release(self.index, self.job_id);
    }
}
