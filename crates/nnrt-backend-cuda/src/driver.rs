//! Dynamically loaded CUDA driver API.

use std::ffi::{c_void, CString};
use std::sync::{Arc, OnceLock};

use libloading::Library;
use nnrt::{DeviceType, Result, Status};

pub(crate) type CUresult = i32;
pub(crate) type CUdevice = i32;
pub(crate) type CUcontext = *mut c_void;
pub(crate) type CUdeviceptr = u64;
pub(crate) type CUmodule = *mut c_void;
pub(crate) type CUfunction = *mut c_void;
pub(crate) type CUstream = *mut c_void;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

/// Overrides the driver library path.
pub const LIBRARY_ENV: &str = "NNRT_CUDA_LIBRARY";

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyV2Fn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemcpyHtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoHAsyncV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuMemcpyDtoDAsyncV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_device: CUdeviceptr,
    byte_count: usize,
    stream: CUstream,
) -> CUresult;
type CuModuleLoadDataExFn = unsafe extern "C" fn(
    module: *mut CUmodule,
    image: *const c_void,
    num_options: u32,
    options: *mut u32,
    option_values: *mut *mut c_void,
) -> CUresult;
type CuModuleUnloadFn = unsafe extern "C" fn(module: CUmodule) -> CUresult;
type CuModuleGetFunctionFn =
    unsafe extern "C" fn(hfunc: *mut CUfunction, hmod: CUmodule, name: *const i8) -> CUresult;
type CuLaunchKernelFn = unsafe extern "C" fn(
    f: CUfunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    h_stream: CUstream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_device_get: CuDeviceGetFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy_v2: CuStreamDestroyV2Fn,
    cu_stream_synchronize: CuStreamSynchronizeFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_memcpy_hto_d_async_v2: CuMemcpyHtoDAsyncV2Fn,
    cu_memcpy_dto_h_async_v2: CuMemcpyDtoHAsyncV2Fn,
    cu_memcpy_dto_d_async_v2: CuMemcpyDtoDAsyncV2Fn,
    cu_module_load_data_ex: CuModuleLoadDataExFn,
    cu_module_unload: CuModuleUnloadFn,
    cu_module_get_function: CuModuleGetFunctionFn,
    cu_launch_kernel: CuLaunchKernelFn,
}

/// The loaded driver library. Contexts, streams and allocations are owned
/// by [`crate::device::CudaContext`] and [`crate::device::CudaMemory`].
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    device_count: i32,
}

static CUDA_DRIVER: OnceLock<std::result::Result<Arc<CudaDriver>, String>> = OnceLock::new();

/// True when the driver loads and reports at least one device.
pub fn is_available() -> bool {
    driver().map_or(false, |driver| driver.device_count() > 0)
}

/// Loads and initializes the driver once per process.
pub fn driver() -> Result<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::load() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(Status::device_error(format!("CUDA driver unavailable: {msg}"))),
    }
}

impl CudaDriver {
    fn load() -> Result<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy_v2: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_stream_synchronize: load_symbol(&lib, b"cuStreamSynchronize\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_memcpy_hto_d_async_v2: load_symbol(&lib, b"cuMemcpyHtoDAsync_v2\0")?,
            cu_memcpy_dto_h_async_v2: load_symbol(&lib, b"cuMemcpyDtoHAsync_v2\0")?,
            cu_memcpy_dto_d_async_v2: load_symbol(&lib, b"cuMemcpyDtoDAsync_v2\0")?,
            cu_module_load_data_ex: load_symbol(&lib, b"cuModuleLoadDataEx\0")?,
            cu_module_unload: load_symbol(&lib, b"cuModuleUnload\0")?,
            cu_module_get_function: load_symbol(&lib, b"cuModuleGetFunction\0")?,
            cu_launch_kernel: load_symbol(&lib, b"cuLaunchKernel\0")?,
        };

        let mut device_count = 0i32;
        // SAFETY: out pointers are valid locals.
        unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
            check_cuda(
                (fns.cu_device_get_count)(&mut device_count as *mut i32),
                "cuDeviceGetCount",
            )?;
        }
        tracing::info!(devices = device_count, "loaded CUDA driver");
        Ok(CudaDriver {
            _lib: lib,
            fns,
            device_count,
        })
    }

    pub fn device_count(&self) -> u32 {
        self.device_count.max(0) as u32
    }

    /// Creates a context and a blocking stream on device `ordinal`.
    /// Returns raw handles stored as `usize`.
    pub(crate) fn create_context(&self, ordinal: u32) -> Result<(usize, usize)> {
        if ordinal >= self.device_count() {
            return Err(Status::device_error(format!(
                "CUDA device {ordinal} does not exist ({} present)",
                self.device_count()
            )));
        }
        // SAFETY: out pointers are valid locals; handles are released by
        // `destroy_context`.
        unsafe {
            let mut dev: CUdevice = 0;
            check_cuda(
                (self.fns.cu_device_get)(&mut dev as *mut CUdevice, ordinal as i32),
                "cuDeviceGet",
            )?;
            let mut ctx: CUcontext = std::ptr::null_mut();
            check_cuda(
                (self.fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                "cuCtxCreate_v2",
            )?;
            let mut stream: CUstream = std::ptr::null_mut();
            if let Err(err) = check_cuda(
                (self.fns.cu_stream_create)(&mut stream as *mut CUstream, 0),
                "cuStreamCreate",
            ) {
                let _ = (self.fns.cu_ctx_destroy_v2)(ctx);
                return Err(err);
            }
            Ok((ctx as usize, stream as usize))
        }
    }

    pub(crate) fn destroy_context(&self, ctx: usize, stream: usize) {
        // SAFETY: handles come from `create_context` and are destroyed once.
        unsafe {
            let _ = (self.fns.cu_ctx_set_current)(ctx as CUcontext);
            let _ = (self.fns.cu_stream_destroy_v2)(stream as CUstream);
            let _ = (self.fns.cu_ctx_destroy_v2)(ctx as CUcontext);
        }
    }

    pub(crate) fn set_current(&self, ctx: usize) -> Result<()> {
        // SAFETY: the context stays alive while any owner of it exists.
        unsafe { check_cuda((self.fns.cu_ctx_set_current)(ctx as CUcontext), "cuCtxSetCurrent") }
    }

    pub(crate) fn stream_synchronize(&self, stream: usize) -> Result<()> {
        // SAFETY: the stream belongs to the current context.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_synchronize)(stream as CUstream),
                "cuStreamSynchronize",
            )
        }
    }

    pub(crate) fn alloc(&self, bytes: usize) -> Result<CUdeviceptr> {
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer.
        let code = unsafe { (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes.max(1)) };
        if code == CUDA_ERROR_OUT_OF_MEMORY {
            return Err(Status::out_of_memory(bytes, DeviceType::Cuda));
        }
        check_cuda(code, "cuMemAlloc_v2")?;
        Ok(ptr)
    }

    pub(crate) fn free(&self, ptr: CUdeviceptr) {
        // SAFETY: `ptr` was returned by `alloc` and is freed once.
        let _ = unsafe { (self.fns.cu_mem_free_v2)(ptr) };
    }

    pub(crate) fn upload(&self, dst: CUdeviceptr, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        // SAFETY: `dst` is valid for `src.len()` bytes.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_v2)(dst, src.as_ptr() as *const c_void, src.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub(crate) fn download(&self, dst: &mut [u8], src: CUdeviceptr) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        // SAFETY: `src` is valid for `dst.len()` bytes.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_h_v2)(dst.as_mut_ptr() as *mut c_void, src, dst.len()),
                "cuMemcpyDtoH_v2",
            )
        }
    }

    /// # Safety
    ///
    /// `src` must stay alive and unmoved until `stream` is synchronized.
    pub(crate) unsafe fn upload_async(&self, dst: CUdeviceptr, src: &[u8], stream: usize) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        check_cuda(
            (self.fns.cu_memcpy_hto_d_async_v2)(
                dst,
                src.as_ptr() as *const c_void,
                src.len(),
                stream as CUstream,
            ),
            "cuMemcpyHtoDAsync_v2",
        )
    }

    /// # Safety
    ///
    /// `dst` must stay alive and unmoved until `stream` is synchronized.
    pub(crate) unsafe fn download_async(&self, dst: &mut [u8], src: CUdeviceptr, stream: usize) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        check_cuda(
            (self.fns.cu_memcpy_dto_h_async_v2)(
                dst.as_mut_ptr() as *mut c_void,
                src,
                dst.len(),
                stream as CUstream,
            ),
            "cuMemcpyDtoHAsync_v2",
        )
    }

    pub(crate) fn copy_async(&self, dst: CUdeviceptr, src: CUdeviceptr, bytes: usize, stream: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        // SAFETY: both ranges are valid device allocations of `bytes`.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_dto_d_async_v2)(dst, src, bytes, stream as CUstream),
                "cuMemcpyDtoDAsync_v2",
            )
        }
    }

    pub(crate) fn load_ptx_module(&self, ptx: &str) -> Result<usize> {
        let c_ptx = CString::new(ptx).map_err(|_| Status::device_error("PTX source contains NUL byte"))?;
        let mut module: CUmodule = std::ptr::null_mut();
        // SAFETY: `c_ptx` is NUL-terminated and outlives the call; no JIT
        // options are passed, so both option arrays may be null.
        unsafe {
            check_cuda(
                (self.fns.cu_module_load_data_ex)(
                    &mut module as *mut CUmodule,
                    c_ptx.as_ptr() as *const c_void,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                ),
                "cuModuleLoadDataEx",
            )?;
        }
        Ok(module as usize)
    }

    pub(crate) fn unload_module(&self, module: usize) {
        // SAFETY: the module was loaded by `load_ptx_module` and is unloaded once.
        let _ = unsafe { (self.fns.cu_module_unload)(module as CUmodule) };
    }

    pub(crate) fn get_function(&self, module: usize, symbol: &str) -> Result<usize> {
        let c_symbol =
            CString::new(symbol).map_err(|_| Status::device_error("kernel symbol contains NUL byte"))?;
        let mut function: CUfunction = std::ptr::null_mut();
        // SAFETY: `module` came from `load_ptx_module` and `c_symbol` is
        // NUL-terminated for the duration of the lookup.
        unsafe {
            check_cuda(
                (self.fns.cu_module_get_function)(
                    &mut function as *mut CUfunction,
                    module as CUmodule,
                    c_symbol.as_ptr(),
                ),
                "cuModuleGetFunction",
            )?;
        }
        Ok(function as usize)
    }

    /// Enqueues `function` on `stream`.
    pub(crate) fn launch_kernel(
        &self,
        function: usize,
        grid: u32,
        block: u32,
        stream: usize,
        params: &mut [*mut c_void],
    ) -> Result<()> {
        // SAFETY: `params` points at live argument values matching the
        // kernel signature.
        unsafe {
            check_cuda(
                (self.fns.cu_launch_kernel)(
                    function as CUfunction,
                    grid,
                    1,
                    1,
                    block,
                    1,
                    1,
                    0,
                    stream as CUstream,
                    params.as_mut_ptr(),
                    std::ptr::null_mut(),
                ),
                "cuLaunchKernel",
            )
        }
    }
}

fn load_cuda_library() -> Result<Library> {
    let mut candidates: Vec<String> = Vec::new();
    if let Some(path) = std::env::var_os(LIBRARY_ENV) {
        candidates.push(path.to_string_lossy().into_owned());
    }
    candidates.extend(
        ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"]
            .iter()
            .map(|s| s.to_string()),
    );

    let opened = candidates.iter().find_map(|candidate| {
        // SAFETY: opening libcuda runs only its own initializers; entry points
        // are resolved and called later by `CudaDriver::load`.
        let lib = unsafe { Library::new(candidate) }.ok()?;
        tracing::debug!(library = %candidate, "opened CUDA driver library");
        Some(lib)
    });
    opened.ok_or_else(|| {
        Status::device_error(format!(
            "no CUDA driver library found (set {LIBRARY_ENV}; searched {})",
            candidates.join(", ")
        ))
    })
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T> {
    // SAFETY: `CudaDriver::load` pairs each entry point name with the
    // `Cu*Fn` alias matching its driver header prototype.
    let entry = unsafe { lib.get::<T>(name) }.map_err(|err| {
        let name = String::from_utf8_lossy(name);
        Status::device_error(format!("CUDA driver has no entry point {name}: {err}"))
    })?;
    Ok(*entry)
}

fn check_cuda(code: CUresult, op: &str) -> Result<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Status::device_error(format!("{op} returned CUresult {code}")))
    }
}
