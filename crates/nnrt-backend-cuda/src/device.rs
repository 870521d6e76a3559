use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use nnrt::device::{CompletionToken, ForwardCallback, PendingRead};
use nnrt::{
    Blob, BlobHandle, Context, DataFormat, DataType, Device, DeviceCapabilities, DeviceMemory,
    DeviceType, Result, Status,
};

use crate::driver::{self, CUdeviceptr, CudaDriver};
use crate::kernels::ptx_module;

/// A CUDA context plus the stream every kernel and async copy of this
/// context is queued on.
pub struct CudaContext {
    driver: Arc<CudaDriver>,
    device_id: u32,
    ctx: usize,
    stream: usize,
    module: OnceLock<std::result::Result<usize, String>>,
}

impl CudaContext {
    fn open(device_id: u32) -> Result<Self> {
        let driver = driver::driver()?;
        // The stream is created blocking, so synchronous copies on the legacy
        // stream are ordered after queued kernels.
        let (ctx, stream) = driver.create_context(device_id)?;
        tracing::debug!(device_id, "opened CUDA context");
        Ok(CudaContext {
            driver,
            device_id,
            ctx,
            stream,
            module: OnceLock::new(),
        })
    }

    /// Makes this context current on the calling thread.
    pub(crate) fn enter(&self) -> Result<&CudaDriver> {
        self.driver.set_current(self.ctx)?;
        Ok(&self.driver)
    }

    pub(crate) fn stream(&self) -> usize {
        self.stream
    }

    /// Resolves a kernel of the built-in PTX module, loading it on first use.
    pub(crate) fn function(&self, symbol: &str) -> Result<usize> {
        let driver = self.enter()?;
        let module = self.module.get_or_init(|| {
            driver
                .load_ptx_module(ptx_module())
                .map_err(|err| err.to_string())
        });
        match module {
            Ok(module) => driver.get_function(*module, symbol),
            Err(msg) => Err(Status::device_error(format!(
                "CUDA kernel module failed to load: {msg}"
            ))),
        }
    }
}

impl Context for CudaContext {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn synchronize(&self) -> Result<()> {
        self.enter()?.stream_synchronize(self.stream)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for CudaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaContext")
            .field("device_id", &self.device_id)
            .field("ctx", &format_args!("{:#x}", self.ctx))
            .finish()
    }
}

impl Drop for CudaContext {
    fn drop(&mut self) {
        if self.driver.set_current(self.ctx).is_ok() {
            let _ = self.driver.stream_synchronize(self.stream);
            if let Some(Ok(module)) = self.module.get() {
                self.driver.unload_module(*module);
            }
        }
        self.driver.destroy_context(self.ctx, self.stream);
    }
}

/// A device allocation. Keeps its context alive.
pub struct CudaMemory {
    ptr: CUdeviceptr,
    bytes: usize,
    context: Arc<CudaContext>,
}

impl CudaMemory {
    pub fn allocate(context: Arc<CudaContext>, bytes: usize) -> Result<Self> {
        let ptr = context.enter()?.alloc(bytes)?;
        Ok(CudaMemory {
            ptr,
            bytes,
            context,
        })
    }

    pub fn device_ptr(&self) -> CUdeviceptr {
        self.ptr
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    /// Device address of `len` bytes at `offset`.
    pub(crate) fn range(&self, offset: usize, len: usize) -> Result<CUdeviceptr> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes => Ok(self.ptr + offset as u64),
            _ => Err(Status::device_error(format!(
                "range {offset}+{len} exceeds CUDA allocation of {} bytes",
                self.bytes
            ))),
        }
    }
}

impl DeviceMemory for CudaMemory {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn byte_len(&self) -> usize {
        self.bytes
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for CudaMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaMemory")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for CudaMemory {
    fn drop(&mut self) {
        match self.context.enter() {
            Ok(driver) => driver.free(self.ptr),
            Err(err) => tracing::warn!(error = %err, "leaking CUDA allocation"),
        }
    }
}

pub(crate) fn cuda_context(context: &dyn Context) -> Result<&CudaContext> {
    context
        .as_any()
        .downcast_ref::<CudaContext>()
        .ok_or_else(|| Status::device_error(format!("{context:?} is not a CUDA context")))
}

pub(crate) fn cuda_memory(memory: &dyn DeviceMemory) -> Result<&CudaMemory> {
    memory
        .as_any()
        .downcast_ref::<CudaMemory>()
        .ok_or_else(|| Status::device_error(format!("{memory:?} is not CUDA memory")))
}

/// Device address of `len` bytes of `handle`.
pub(crate) fn handle_ptr(handle: &BlobHandle, len: usize) -> Result<CUdeviceptr> {
    cuda_memory(handle.memory.as_ref())?.range(handle.offset, len)
}

pub(crate) fn blob_ptr(blob: &Blob) -> Result<CUdeviceptr> {
    handle_ptr(blob.handle(), blob.desc().byte_size())
}

pub struct CudaDevice {
    capabilities: DeviceCapabilities,
    contexts: Mutex<Vec<(u32, std::sync::Weak<CudaContext>)>>,
}

impl CudaDevice {
    pub fn new() -> Self {
        CudaDevice {
            capabilities: DeviceCapabilities {
                data_types: vec![DataType::Float32],
                data_formats: vec![DataFormat::Nchw],
                native_format: DataFormat::Nchw,
                supports_async_forward: true,
                supports_reshape: true,
                supports_external_forward_memory: true,
                native_int8_weights: false,
            },
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Contexts are shared per device id while any network holds one.
    fn context_for(&self, device_id: u32) -> Result<Arc<CudaContext>> {
        let mut contexts = self
            .contexts
            .lock()
            .map_err(|_| Status::device_error("CUDA context table poisoned"))?;
        contexts.retain(|(_, weak)| weak.strong_count() > 0);
        if let Some(existing) = contexts
            .iter()
            .find(|(id, _)| *id == device_id)
            .and_then(|(_, weak)| weak.upgrade())
        {
            return Ok(existing);
        }
        let context = Arc::new(CudaContext::open(device_id)?);
        contexts.push((device_id, Arc::downgrade(&context)));
        Ok(context)
    }

    fn owned_context(&self, context: &dyn Context) -> Result<Arc<CudaContext>> {
        let id = cuda_context(context)?.device_id;
        self.context_for(id)
    }
}

impl Default for CudaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for CudaDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn name(&self) -> &str {
        "cuda"
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_context(&self, device_id: u32) -> Result<Arc<dyn Context>> {
        Ok(self.context_for(device_id)?)
    }

    fn allocate(&self, context: &dyn Context, byte_size: usize) -> Result<Arc<dyn DeviceMemory>> {
        let context = self.owned_context(context)?;
        Ok(Arc::new(CudaMemory::allocate(context, byte_size)?))
    }

    fn copy_host_to_device(&self, context: &dyn Context, dst: &BlobHandle, src: &[u8]) -> Result<()> {
        let driver = cuda_context(context)?.enter()?;
        driver.upload(handle_ptr(dst, src.len())?, src)
    }

    fn copy_device_to_host(
        &self,
        context: &dyn Context,
        src: &BlobHandle,
        dst: &mut [u8],
    ) -> Result<()> {
        let driver = cuda_context(context)?.enter()?;
        driver.download(dst, handle_ptr(src, dst.len())?)
    }

    fn copy_host_to_device_async(
        &self,
        context: &Arc<dyn Context>,
        dst: &BlobHandle,
        src: Vec<u8>,
    ) -> Result<CompletionToken> {
        let cuda = cuda_context(context.as_ref())?;
        let ptr = handle_ptr(dst, src.len())?;
        let driver = cuda.enter()?;
        // SAFETY: the token owns `src` and synchronizes before releasing it.
        unsafe { driver.upload_async(ptr, &src, cuda.stream())? };
        Ok(CompletionToken::pending(Arc::clone(context), Some(src)))
    }

    fn copy_device_to_host_async(
        &self,
        context: &Arc<dyn Context>,
        src: &BlobHandle,
        len: usize,
    ) -> Result<PendingRead> {
        let cuda = cuda_context(context.as_ref())?;
        let ptr = handle_ptr(src, len)?;
        let mut data = vec![0u8; len];
        let driver = cuda.enter()?;
        // SAFETY: the pending read owns `data` and synchronizes before
        // handing it out or dropping it.
        unsafe { driver.download_async(&mut data, ptr, cuda.stream())? };
        Ok(PendingRead::pending(Arc::clone(context), data))
    }

    /// Only the identity conversion exists; it is queued as a device copy.
    fn convert_layout(&self, context: &dyn Context, src: &Blob, dst: &Blob) -> Result<()> {
        if src.dims() != dst.dims() || src.data_type() != dst.data_type() {
            return Err(Status::param(format!(
                "layout conversion needs matching blobs, got {:?} and {:?}",
                src.desc(),
                dst.desc()
            )));
        }
        if src.data_format() != dst.data_format() {
            return Err(Status::unsupported_format(format!(
                "cuda cannot convert {} to {}",
                src.data_format(),
                dst.data_format()
            )));
        }
        let cuda = cuda_context(context)?;
        let (from, to) = (blob_ptr(src)?, blob_ptr(dst)?);
        cuda.enter()?
            .copy_async(to, from, src.desc().byte_size(), cuda.stream())
    }

    fn import_memory(&self, memory: Arc<dyn DeviceMemory>) -> Result<Arc<dyn DeviceMemory>> {
        cuda_memory(memory.as_ref())?;
        Ok(memory)
    }

    fn notify_on_completion(&self, context: &Arc<dyn Context>, callback: ForwardCallback) {
        let slot = Arc::new(Mutex::new(Some(callback)));
        let worker_slot = Arc::clone(&slot);
        let worker_context = Arc::clone(context);
        let spawned = std::thread::Builder::new()
            .name("nnrt-cuda-completion".to_string())
            .spawn(move || {
                let result = worker_context.synchronize();
                if let Some(callback) = take_callback(&worker_slot) {
                    callback(result);
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "completion thread unavailable, synchronizing inline");
            if let Some(callback) = take_callback(&slot) {
                callback(context.synchronize());
            }
        }
    }
}

fn take_callback(slot: &Mutex<Option<ForwardCallback>>) -> Option<ForwardCallback> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}
