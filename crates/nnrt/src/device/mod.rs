//! Device abstraction.
//!
//! A [`Device`] is a stateless factory for one compute backend: it opens
//! [`Context`]s, allocates [`DeviceMemory`], moves bytes between host and
//! device, and converts blob layouts. Devices are looked up by
//! [`DeviceType`] through an explicit [`crate::Registry`].

mod token;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use token::{CompletionToken, PendingRead};

use crate::blob::{Blob, BlobDesc, BlobHandle, DataFormat, DataType};
use crate::status::{Result, Status};

/// Key used to register and look up devices and kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Reference host implementation.
    Naive,
    X86,
    Arm,
    Cuda,
    OpenCl,
    Metal,
    Atlas,
    /// Out-of-tree or test backends.
    Custom(u16),
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Naive => f.write_str("naive"),
            DeviceType::X86 => f.write_str("x86"),
            DeviceType::Arm => f.write_str("arm"),
            DeviceType::Cuda => f.write_str("cuda"),
            DeviceType::OpenCl => f.write_str("opencl"),
            DeviceType::Metal => f.write_str("metal"),
            DeviceType::Atlas => f.write_str("atlas"),
            DeviceType::Custom(id) => write!(f, "custom:{id}"),
        }
    }
}

/// What a device can do. Queried by the optimizer and the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub data_types: Vec<DataType>,
    pub data_formats: Vec<DataFormat>,
    /// Layout the device's compute-heavy kernels prefer.
    pub native_format: DataFormat,
    /// `false` means `forward_async` runs synchronously and then calls back.
    pub supports_async_forward: bool,
    pub supports_reshape: bool,
    pub supports_external_forward_memory: bool,
    /// The device consumes int8 weights directly, so dequantization is skipped.
    pub native_int8_weights: bool,
}

impl DeviceCapabilities {
    pub fn supports_data_type(&self, data_type: DataType) -> bool {
        self.data_types.contains(&data_type)
    }

    pub fn supports_format(&self, format: DataFormat) -> bool {
        self.data_formats.contains(&format)
    }
}

/// One open connection to a backend (queue/stream equivalent).
pub trait Context: Send + Sync + fmt::Debug {
    fn device_type(&self) -> DeviceType;

    fn device_id(&self) -> u32;

    /// Blocks until all work submitted on this context has completed.
    fn synchronize(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// A device allocation.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    fn device_type(&self) -> DeviceType;

    fn byte_len(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

/// Callback handed to [`crate::Network::forward_async`].
pub type ForwardCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

pub trait Device: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Human-readable backend name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> &DeviceCapabilities;

    /// Opens a context. Fails with `DeviceError` when the backend runtime is
    /// missing, the id is invalid or queue creation fails.
    fn create_context(&self, device_id: u32) -> Result<Arc<dyn Context>>;

    /// Allocates `byte_size` bytes, failing with `OutOfMemory`.
    fn allocate(&self, context: &dyn Context, byte_size: usize) -> Result<Arc<dyn DeviceMemory>>;

    /// Blocking upload of `src` into `dst`.
    fn copy_host_to_device(&self, context: &dyn Context, dst: &BlobHandle, src: &[u8])
        -> Result<()>;

    /// Blocking download of `dst.len()` bytes from `src`.
    fn copy_device_to_host(
        &self,
        context: &dyn Context,
        src: &BlobHandle,
        dst: &mut [u8],
    ) -> Result<()>;

    /// Queues an upload. The token keeps `src` alive until it is
    /// synchronized or dropped.
    fn copy_host_to_device_async(
        &self,
        context: &Arc<dyn Context>,
        dst: &BlobHandle,
        src: Vec<u8>,
    ) -> Result<CompletionToken> {
        self.copy_host_to_device(context.as_ref(), dst, &src)?;
        Ok(CompletionToken::completed())
    }

    /// Queues a download of `len` bytes.
    fn copy_device_to_host_async(
        &self,
        context: &Arc<dyn Context>,
        src: &BlobHandle,
        len: usize,
    ) -> Result<PendingRead> {
        let mut data = vec![0u8; len];
        self.copy_device_to_host(context.as_ref(), src, &mut data)?;
        Ok(PendingRead::ready(data))
    }

    /// Writes `src` into `dst` using `dst`'s declared format. Both blobs
    /// must already be allocated with the same dims and data type.
    fn convert_layout(&self, context: &dyn Context, src: &Blob, dst: &Blob) -> Result<()>;

    /// Adopts caller-supplied memory as forward memory.
    fn import_memory(&self, memory: Arc<dyn DeviceMemory>) -> Result<Arc<dyn DeviceMemory>> {
        let _ = memory;
        Err(Status::device_not_supported(
            self.device_type(),
            "external forward memory",
        ))
    }

    /// Arranges for `callback` to run once all work queued on `context`
    /// has finished. Hosts without an async path synchronize and call
    /// back inline.
    fn notify_on_completion(&self, context: &Arc<dyn Context>, callback: ForwardCallback) {
        callback(context.synchronize());
    }
}

/// A device together with the context opened on it.
#[derive(Clone)]
pub struct DeviceHandle {
    device: Arc<dyn Device>,
    context: Arc<dyn Context>,
}

impl DeviceHandle {
    pub fn new(device: Arc<dyn Device>, context: Arc<dyn Context>) -> Self {
        DeviceHandle { device, context }
    }

    /// Opens a fresh context on `device`.
    pub fn open(device: Arc<dyn Device>, device_id: u32) -> Result<Self> {
        let context = device.create_context(device_id)?;
        Ok(DeviceHandle { device, context })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn context(&self) -> &Arc<dyn Context> {
        &self.context
    }

    pub fn device_type(&self) -> DeviceType {
        self.device.device_type()
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.device.capabilities()
    }

    pub fn allocate(&self, byte_size: usize) -> Result<Arc<dyn DeviceMemory>> {
        self.device.allocate(self.context.as_ref(), byte_size)
    }

    pub fn synchronize(&self) -> Result<()> {
        self.context.synchronize()
    }

    /// Uploads `data` into `blob`'s physical layout.
    pub fn write_blob<T: bytemuck::Pod>(&self, blob: &Blob, data: &[T]) -> Result<()> {
        check_element_size::<T>(blob)?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() != blob.desc().byte_size() {
            return Err(Status::param(format!(
                "blob '{}' expects {} bytes, got {}",
                blob.name(),
                blob.desc().byte_size(),
                bytes.len()
            )));
        }
        self.device
            .copy_host_to_device(self.context.as_ref(), blob.handle(), bytes)
    }

    /// Downloads `blob`'s physical layout.
    pub fn read_blob<T: bytemuck::Pod>(&self, blob: &Blob) -> Result<Vec<T>> {
        check_element_size::<T>(blob)?;
        let mut bytes = vec![0u8; blob.desc().byte_size()];
        self.device
            .copy_device_to_host(self.context.as_ref(), blob.handle(), &mut bytes)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    /// Produces a new owned blob holding `src` in `dst_format`.
    pub fn convert_layout(&self, src: &Blob, dst_format: DataFormat) -> Result<Blob> {
        let mut desc: BlobDesc = src.desc().clone();
        desc.data_format = dst_format;
        if !self.capabilities().supports_format(dst_format) {
            return Err(Status::unsupported_format(format!(
                "device {} cannot hold blob '{}' in {}",
                self.device_type(),
                src.name(),
                dst_format
            )));
        }
        let dst = Blob::allocate(desc, self)?;
        self.device.convert_layout(self.context.as_ref(), src, &dst)?;
        Ok(dst)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.device.name())
            .field("context", &self.context)
            .finish()
    }
}

fn check_element_size<T>(blob: &Blob) -> Result<()> {
    let expected = blob.data_type().size_in_bytes();
    if std::mem::size_of::<T>() != expected {
        return Err(Status::param(format!(
            "blob '{}' holds {} elements ({} bytes each), host element is {} bytes",
            blob.name(),
            blob.data_type(),
            expected,
            std::mem::size_of::<T>()
        )));
    }
    Ok(())
}
