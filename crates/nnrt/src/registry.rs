//! Explicit device and kernel registry.
//!
//! Backend crates contribute a registrar function to [`REGISTRARS`]; the
//! process builds one immutable [`Registry`] from them (or from explicit
//! registrar calls) and passes it by reference to every engine. Lookups are
//! hash-map hits and never fall back to another device or operator.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::device::{Device, DeviceType};
use crate::layer::{KernelRegistration, LayerType};
use crate::status::{ErrorKind, Result, Status};

/// Adds a backend's devices and kernels to a builder.
pub type Registrar = fn(&mut RegistryBuilder) -> Result<()>;

/// Registrars linked into the binary. Backend crates append to this slice.
#[linkme::distributed_slice]
pub static REGISTRARS: [Registrar] = [..];

#[derive(Default)]
pub struct RegistryBuilder {
    devices: HashMap<DeviceType, Arc<dyn Device>>,
    kernels: HashMap<(LayerType, DeviceType), KernelRegistration>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_device(&mut self, device: Arc<dyn Device>) -> Result<&mut Self> {
        let kind = device.device_type();
        if self.devices.contains_key(&kind) {
            return Err(Status::new(
                ErrorKind::DuplicateRegistration,
                format!("device {kind} is already registered"),
            ));
        }
        tracing::debug!(device = %kind, name = device.name(), "registered device");
        self.devices.insert(kind, device);
        Ok(self)
    }

    /// Registers one kernel after validating its promotion table.
    pub fn register_kernel(&mut self, registration: KernelRegistration) -> Result<&mut Self> {
        let key = (registration.layer_type, registration.device_type);
        if self.kernels.contains_key(&key) {
            return Err(Status::new(
                ErrorKind::DuplicateRegistration,
                format!(
                    "kernel for operator {} on device {} is already registered",
                    key.0, key.1
                ),
            ));
        }
        registration.promotion.validate()?;
        self.kernels.insert(key, registration);
        Ok(self)
    }

    pub fn register_kernels(&mut self, registrations: &[KernelRegistration]) -> Result<&mut Self> {
        for registration in registrations {
            self.register_kernel(*registration)?;
        }
        Ok(self)
    }

    /// Runs every linked registrar.
    pub fn register_linked(&mut self) -> Result<&mut Self> {
        for registrar in REGISTRARS.iter() {
            registrar(self)?;
        }
        Ok(self)
    }

    /// Freezes the builder. Every kernel must target a registered device,
    /// compute in a type the device supports and use a layout it holds.
    pub fn build(self) -> Result<Registry> {
        for registration in self.kernels.values() {
            let device = self.devices.get(&registration.device_type).ok_or_else(|| {
                Status::new(
                    ErrorKind::UnknownDevice,
                    format!(
                        "kernel {} targets unregistered device {}",
                        registration.layer_type, registration.device_type
                    ),
                )
            })?;
            let caps = device.capabilities();
            if !caps.supports_format(registration.data_format) {
                return Err(Status::unsupported_format(format!(
                    "kernel {} on {} uses {} which the device does not hold",
                    registration.layer_type, registration.device_type, registration.data_format
                )));
            }
            for rule in registration.promotion.rules {
                if !caps.supports_data_type(rule.compute) || !caps.supports_data_type(rule.output) {
                    return Err(Status::new(
                        ErrorKind::UnsupportedTypeCombination,
                        format!(
                            "{}: device {} cannot compute {:?}",
                            registration.promotion.name, registration.device_type, rule
                        ),
                    ));
                }
            }
        }
        tracing::debug!(
            devices = self.devices.len(),
            kernels = self.kernels.len(),
            "registry built"
        );
        Ok(Registry {
            devices: self.devices,
            kernels: self.kernels,
        })
    }
}

/// Immutable lookup table of devices and kernels.
pub struct Registry {
    devices: HashMap<DeviceType, Arc<dyn Device>>,
    kernels: HashMap<(LayerType, DeviceType), KernelRegistration>,
}

impl Registry {
    /// Builds a registry from every registrar linked into the binary.
    pub fn builtin() -> Result<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.register_linked()?;
        builder.build()
    }

    pub fn device(&self, kind: DeviceType) -> Result<Arc<dyn Device>> {
        self.devices.get(&kind).cloned().ok_or_else(|| {
            Status::new(
                ErrorKind::UnknownDevice,
                format!("no device registered for {kind}"),
            )
        })
    }

    pub fn has_device(&self, kind: DeviceType) -> bool {
        self.devices.contains_key(&kind)
    }

    /// Exact `(layer, device)` lookup.
    pub fn kernel(&self, layer: LayerType, device: DeviceType) -> Result<&KernelRegistration> {
        self.kernels
            .get(&(layer, device))
            .ok_or_else(|| Status::unsupported_operator(layer, device))
    }

    pub fn has_kernel(&self, layer: LayerType, device: DeviceType) -> bool {
        self.kernels.contains_key(&(layer, device))
    }

    pub fn device_types(&self) -> Vec<DeviceType> {
        let mut kinds: Vec<DeviceType> = self.devices.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn kernels_for(&self, device: DeviceType) -> impl Iterator<Item = &KernelRegistration> {
        self.kernels
            .values()
            .filter(move |registration| registration.device_type == device)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("devices", &self.device_types())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}
