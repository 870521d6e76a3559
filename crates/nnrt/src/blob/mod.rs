//! Typed, shaped memory handles.
//!
//! A [`Blob`] pairs a [`BlobDesc`] with device storage. Storage is either
//! owned (allocated through a [`DeviceHandle`], may grow on reshape) or
//! external (supplied by the caller, fixed capacity). Blobs never convert
//! data type or layout themselves; see [`DeviceHandle::convert_layout`].

pub mod dims;
mod dtype;
mod format;
pub mod layout;

use std::fmt;
use std::sync::Arc;

pub use dims::DimsVector;
pub use dtype::DataType;
pub use format::DataFormat;

use crate::device::{DeviceHandle, DeviceMemory, DeviceType};
use crate::status::{Result, Status};

/// Static description of one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDesc {
    pub device_type: DeviceType,
    pub data_type: DataType,
    pub data_format: DataFormat,
    pub dims: DimsVector,
    pub name: String,
}

impl BlobDesc {
    pub fn new(
        name: impl Into<String>,
        device_type: DeviceType,
        data_type: DataType,
        data_format: DataFormat,
        dims: &[usize],
    ) -> Self {
        BlobDesc {
            device_type,
            data_type,
            data_format,
            dims: DimsVector::from_slice(dims),
            name: name.into(),
        }
    }

    /// Logical element count.
    pub fn count(&self) -> usize {
        dims::count(&self.dims)
    }

    /// Element count of the physical layout, padding included.
    pub fn storage_count(&self) -> usize {
        match self.data_format {
            DataFormat::Nc4hw4 => layout::packed_len(&self.dims),
            _ => self.count(),
        }
    }

    /// Bytes needed to hold the blob in its declared format.
    pub fn byte_size(&self) -> usize {
        self.storage_count() * self.data_type.size_in_bytes()
    }
}

/// Reference to device storage at a byte offset.
#[derive(Clone)]
pub struct BlobHandle {
    pub memory: Arc<dyn DeviceMemory>,
    pub offset: usize,
}

impl BlobHandle {
    pub fn new(memory: Arc<dyn DeviceMemory>) -> Self {
        BlobHandle { memory, offset: 0 }
    }

    pub fn with_offset(memory: Arc<dyn DeviceMemory>, offset: usize) -> Self {
        BlobHandle { memory, offset }
    }

    /// Bytes available from `offset` to the end of the allocation.
    pub fn capacity(&self) -> usize {
        self.memory.byte_len().saturating_sub(self.offset)
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .finish()
    }
}

/// A typed, shaped, device-resident tensor.
#[derive(Clone)]
pub struct Blob {
    desc: BlobDesc,
    handle: BlobHandle,
    capacity: usize,
    owner: Option<DeviceHandle>,
}

impl Blob {
    /// Wraps externally supplied storage. The blob does not own it and
    /// cannot grow past the handle's capacity.
    pub fn new(desc: BlobDesc, handle: BlobHandle) -> Result<Self> {
        let capacity = handle.capacity();
        if desc.byte_size() > capacity {
            return Err(Status::shape(format!(
                "blob '{}' needs {} bytes but the supplied memory holds {}",
                desc.name,
                desc.byte_size(),
                capacity
            )));
        }
        Ok(Blob {
            desc,
            handle,
            capacity,
            owner: None,
        })
    }

    /// Non-owning view of at most `capacity` bytes starting at `handle`.
    pub fn view(desc: BlobDesc, handle: BlobHandle, capacity: usize) -> Result<Self> {
        let capacity = capacity.min(handle.capacity());
        if desc.byte_size() > capacity {
            return Err(Status::shape(format!(
                "blob '{}' needs {} bytes but the view holds {}",
                desc.name,
                desc.byte_size(),
                capacity
            )));
        }
        Ok(Blob {
            desc,
            handle,
            capacity,
            owner: None,
        })
    }

    /// Allocates owned storage for `desc` on `device`.
    pub fn allocate(desc: BlobDesc, device: &DeviceHandle) -> Result<Self> {
        let bytes = desc.byte_size();
        let memory = device.allocate(bytes)?;
        Ok(Blob {
            desc,
            handle: BlobHandle::new(memory),
            capacity: bytes,
            owner: Some(device.clone()),
        })
    }

    pub fn desc(&self) -> &BlobDesc {
        &self.desc
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn dims(&self) -> &[usize] {
        &self.desc.dims
    }

    pub fn data_type(&self) -> DataType {
        self.desc.data_type
    }

    pub fn data_format(&self) -> DataFormat {
        self.desc.data_format
    }

    pub fn handle(&self) -> &BlobHandle {
        &self.handle
    }

    /// Bytes the backing region can hold for this blob.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn owns_storage(&self) -> bool {
        self.owner.is_some()
    }

    /// Changes the dims. The allocation is kept when the new size fits;
    /// owned blobs reallocate (contents are not preserved) when it grows,
    /// external blobs fail with `ShapeError`.
    pub fn reshape(&mut self, dims: &[usize]) -> Result<()> {
        let mut desc = self.desc.clone();
        desc.dims = DimsVector::from_slice(dims);
        let bytes = desc.byte_size();
        if bytes > self.capacity {
            let Some(owner) = self.owner.as_ref() else {
                return Err(Status::shape(format!(
                    "blob '{}' cannot grow to {:?}: {} bytes needed, external capacity is {}",
                    desc.name, dims, bytes, self.capacity
                )));
            };
            self.handle = BlobHandle::new(owner.allocate(bytes)?);
            self.capacity = bytes;
        }
        self.desc = desc;
        Ok(())
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("desc", &self.desc)
            .field("offset", &self.handle.offset)
            .field("capacity", &self.capacity)
            .field("owned", &self.owner.is_some())
            .finish()
    }
}
