//! Layer kinds, parameters, resources and the kernel contract.

pub mod cast;
mod layer_type;
pub mod param;
pub mod resource;

use std::fmt;
use std::sync::Arc;

pub use layer_type::{LayerType, ParamKind};
pub use param::LayerParam;
pub use resource::{LayerResource, QuantParams, RawBuffer, RawData};

use crate::blob::{Blob, BlobDesc, DataFormat};
use crate::device::{DeviceHandle, DeviceType};
use crate::graph::LayerInfo;
use crate::status::Result;
use cast::{PromotionRule, PromotionTable};

/// A device- and operator-specific executable bound to one layer.
///
/// Kernels on devices with a real async path only enqueue work in
/// `forward`; the engine synchronizes the context afterwards.
pub trait LayerAcc: Send {
    /// Re-derives shape-dependent state after the blobs were reshaped.
    fn reshape(&mut self, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let _ = (inputs, outputs);
        Ok(())
    }

    fn forward(&mut self, device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()>;
}

/// Everything a kernel factory sees when it instantiates a kernel.
pub struct KernelContext<'a> {
    pub layer: &'a LayerInfo,
    pub resource: Option<&'a Arc<LayerResource>>,
    pub device: &'a DeviceHandle,
    pub promotion: &'a PromotionRule,
    pub inputs: &'a [BlobDesc],
    pub outputs: &'a [BlobDesc],
}

pub type KernelCreator = fn(&KernelContext<'_>) -> Result<Box<dyn LayerAcc>>;

/// One `(layer, device)` entry of the kernel table.
#[derive(Clone, Copy)]
pub struct KernelRegistration {
    pub layer_type: LayerType,
    pub device_type: DeviceType,
    /// Layout the kernel reads its blob inputs in and writes outputs in.
    pub data_format: DataFormat,
    pub promotion: &'static PromotionTable,
    pub create: KernelCreator,
}

impl fmt::Debug for KernelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistration")
            .field("layer_type", &self.layer_type)
            .field("device_type", &self.device_type)
            .field("data_format", &self.data_format)
            .field("promotion", &self.promotion.name)
            .finish()
    }
}
