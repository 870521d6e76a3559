//! CUDA backend.
//!
//! The driver library is loaded at runtime, so the crate builds and
//! registers everywhere; opening a context fails with `DeviceError` on
//! machines without a driver or GPU. Kernels cover same-shape `f32`
//! elementwise layers, fused elementwise chains and reshape. Work is queued
//! on one stream per context and `forward_async` completes on a helper
//! thread.

mod device;
mod driver;
mod kernels;

use std::sync::Arc;

use nnrt::registry::{Registrar, RegistryBuilder};
use nnrt::Result;

pub use device::{CudaContext, CudaDevice, CudaMemory};
pub use driver::{driver, is_available, CudaDriver, LIBRARY_ENV};
pub use kernels::{cuda_registrations, CUDA_F32};

pub fn register_cuda_backend(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register_device(Arc::new(CudaDevice::new()))?;
    builder.register_kernels(&cuda_registrations())?;
    Ok(())
}

#[nnrt::linkme::distributed_slice(nnrt::registry::REGISTRARS)]
#[linkme(crate = nnrt::linkme)]
static REGISTER_CUDA_BACKEND: Registrar = register_cuda_backend;
