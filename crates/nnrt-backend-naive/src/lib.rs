//! Reference host backend.
//!
//! Registers the `naive` device and a kernel for every layer type. The
//! memory, device and blob helpers are shared with the optimized CPU
//! backends.

pub mod device;
pub mod host;
pub mod kernels;
pub mod memory;
pub mod tables;

use std::sync::Arc;

use nnrt::registry::{Registrar, RegistryBuilder};
use nnrt::{DeviceType, Result};

pub use device::{host_capabilities, HostDevice};
pub use memory::{host_memory, HostContext, HostMemory};

/// Adds the naive device and its kernels to `builder`.
pub fn register_naive_backend(builder: &mut RegistryBuilder) -> Result<()> {
    builder.register_device(Arc::new(HostDevice::naive()))?;
    let registrations = kernels::reference_registrations(DeviceType::Naive, &[]);
    builder.register_kernels(&registrations)?;
    tracing::debug!(kernels = registrations.len(), "registered naive backend");
    Ok(())
}

#[nnrt::linkme::distributed_slice(nnrt::registry::REGISTRARS)]
#[linkme(crate = nnrt::linkme)]
static REGISTER_NAIVE_BACKEND: Registrar = register_naive_backend;
