use std::sync::Arc;

use nnrt::{
    Blob, BlobHandle, Context, DataFormat, Device, DeviceCapabilities, DeviceMemory, DeviceType,
    Result, Status,
};

use crate::host;
use crate::memory::{host_memory, HostContext, HostMemory};
use crate::tables::HOST_DATA_TYPES;

/// A device whose memory is host RAM and whose work runs on the calling
/// thread. Shared by the reference and optimized CPU backends.
pub struct HostDevice {
    device_type: DeviceType,
    name: &'static str,
    capabilities: DeviceCapabilities,
}

impl HostDevice {
    pub fn new(device_type: DeviceType, name: &'static str, capabilities: DeviceCapabilities) -> Self {
        HostDevice {
            device_type,
            name,
            capabilities,
        }
    }

    /// The reference device: every host type, plain NCHW compute.
    pub fn naive() -> Self {
        Self::new(
            DeviceType::Naive,
            "naive",
            host_capabilities(DataFormat::Nchw),
        )
    }
}

/// Capabilities of a host device computing natively in `native_format`.
pub fn host_capabilities(native_format: DataFormat) -> DeviceCapabilities {
    DeviceCapabilities {
        data_types: HOST_DATA_TYPES.to_vec(),
        data_formats: vec![DataFormat::Nchw, DataFormat::Nc4hw4, DataFormat::Nhwc],
        native_format,
        supports_async_forward: false,
        supports_reshape: true,
        supports_external_forward_memory: true,
        native_int8_weights: false,
    }
}

impl Device for HostDevice {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn name(&self) -> &str {
        self.name
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_context(&self, device_id: u32) -> Result<Arc<dyn Context>> {
        if device_id != 0 {
            return Err(Status::device_error(format!(
                "{} has a single device, id {device_id} is invalid",
                self.name
            )));
        }
        Ok(Arc::new(HostContext::new(self.device_type, device_id)))
    }

    fn allocate(&self, _context: &dyn Context, byte_size: usize) -> Result<Arc<dyn DeviceMemory>> {
        Ok(Arc::new(HostMemory::allocate(self.device_type, byte_size)?))
    }

    fn copy_host_to_device(&self, _context: &dyn Context, dst: &BlobHandle, src: &[u8]) -> Result<()> {
        let memory = host_memory(dst.memory.as_ref())?;
        // SAFETY: the caller hands over `dst` for the duration of the copy.
        let target = unsafe { memory.bytes_mut(dst.offset, src.len())? };
        target.copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        _context: &dyn Context,
        src: &BlobHandle,
        dst: &mut [u8],
    ) -> Result<()> {
        let memory = host_memory(src.memory.as_ref())?;
        // SAFETY: nothing writes `src` while a forward pass is not running.
        let source = unsafe { memory.bytes(src.offset, dst.len())? };
        dst.copy_from_slice(source);
        Ok(())
    }

    fn convert_layout(&self, _context: &dyn Context, src: &Blob, dst: &Blob) -> Result<()> {
        if src.dims() != dst.dims() || src.data_type() != dst.data_type() {
            return Err(Status::param(format!(
                "layout conversion needs matching blobs, got {:?} and {:?}",
                src.desc(),
                dst.desc()
            )));
        }
        // SAFETY: `src` and `dst` are distinct live tensors and never share bytes.
        let (from, to) = unsafe { (host::blob_bytes(src)?, host::blob_bytes_mut(dst)?) };
        host::convert_bytes(
            src.data_format(),
            dst.data_format(),
            from,
            to,
            src.dims(),
            src.data_type().size_in_bytes(),
        )
    }

    fn import_memory(&self, memory: Arc<dyn DeviceMemory>) -> Result<Arc<dyn DeviceMemory>> {
        host_memory(memory.as_ref())?;
        Ok(memory)
    }
}
