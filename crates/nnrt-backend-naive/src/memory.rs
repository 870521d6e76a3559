//! Host allocations and contexts shared by every CPU device.

use std::alloc::{self, Layout};
use std::any::Any;
use std::fmt;
use std::ptr::NonNull;

use nnrt::network::FORWARD_MEMORY_ALIGNMENT;
use nnrt::{Context, DeviceMemory, DeviceType, Result, Status};

/// Zero-initialized host allocation.
///
/// Several blobs may view one allocation (forward memory). They always use
/// disjoint byte ranges while they are live, which is what the unsafe
/// accessors rely on.
pub struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
    layout: Option<Layout>,
    device_type: DeviceType,
}

// SAFETY: the region is plain bytes with no thread affinity. Concurrent
// access is governed by the contracts of `bytes` and `bytes_mut`.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl HostMemory {
    pub fn allocate(device_type: DeviceType, len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(HostMemory {
                ptr: NonNull::dangling(),
                len: 0,
                layout: None,
                device_type,
            });
        }
        let layout = Layout::from_size_align(len, FORWARD_MEMORY_ALIGNMENT)
            .map_err(|_| Status::out_of_memory(len, device_type))?;
        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| Status::out_of_memory(len, device_type))?;
        Ok(HostMemory {
            ptr,
            len,
            layout: Some(layout),
            device_type,
        })
    }

    /// Wraps a region owned by the caller. It is never freed by `HostMemory`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` initialized bytes
    /// for as long as the returned value lives.
    pub unsafe fn from_raw_parts(device_type: DeviceType, ptr: NonNull<u8>, len: usize) -> Self {
        HostMemory {
            ptr,
            len,
            layout: None,
            device_type,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_owned(&self) -> bool {
        self.layout.is_some()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Status::param(format!(
                "range {offset}+{len} exceeds host allocation of {} bytes",
                self.len
            ))),
        }
    }

    /// # Safety
    ///
    /// No mutable slice overlapping `offset..offset + len` may be alive
    /// while the returned slice is.
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check_range(offset, len)?;
        Ok(std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len))
    }

    /// # Safety
    ///
    /// No other slice overlapping `offset..offset + len` may be alive while
    /// the returned slice is.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check_range(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len))
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: `ptr` came from `alloc_zeroed` with this layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("device_type", &self.device_type)
            .field("len", &self.len)
            .field("owned", &self.is_owned())
            .finish()
    }
}

impl DeviceMemory for HostMemory {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn byte_len(&self) -> usize {
        self.len
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Resolves a device allocation to host memory.
pub fn host_memory(memory: &dyn DeviceMemory) -> Result<&HostMemory> {
    memory.as_any().downcast_ref::<HostMemory>().ok_or_else(|| {
        Status::device_error(format!(
            "{} allocation is not host memory",
            memory.device_type()
        ))
    })
}

/// Host contexts execute inline, so synchronization is a no-op.
#[derive(Debug)]
pub struct HostContext {
    device_type: DeviceType,
    device_id: u32,
}

impl HostContext {
    pub fn new(device_type: DeviceType, device_id: u32) -> Self {
        HostContext {
            device_type,
            device_id,
        }
    }
}

impl Context for HostContext {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
