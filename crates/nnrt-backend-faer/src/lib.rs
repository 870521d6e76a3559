//! Optimized CPU backend.
//!
//! Registers the `x86` and `arm` devices. Convolution and elementwise
//! layers run natively in the packed `Nc4hw4` layout, matrix products go
//! through faer's GEMM, and every other layer falls back to the reference
//! host kernels. LSTM is not provided.

mod conv;
mod gemm;
mod packed;

use std::sync::Arc;

use faer::Par;
use nnrt::layer::cast::{PromotionRule, PromotionTable};
use nnrt::layer::{KernelCreator, KernelRegistration, LayerType};
use nnrt::registry::{Registrar, RegistryBuilder};
use nnrt::{DataFormat, DataType, DeviceType, Result};
use nnrt_backend_naive::kernels::reference_registrations;
use nnrt_backend_naive::{host_capabilities, tables, HostDevice};

pub use conv::conv2d_nc4hw4;
pub use gemm::gemm_row_major;

/// Packed kernels read and write `f32` storage directly.
pub static PACKED_F32: PromotionTable = PromotionTable {
    name: "faer_packed_f32",
    rules: &[PromotionRule::uniform(
        DataType::Float32,
        DataType::Float32,
        DataType::Float32,
    )],
};

pub(crate) fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

/// Layers with a faer kernel; the rest use the reference kernels.
const NATIVE_LAYERS: &[LayerType] = &[
    LayerType::Add,
    LayerType::Sub,
    LayerType::Mul,
    LayerType::Div,
    LayerType::Mod,
    LayerType::Maximum,
    LayerType::Minimum,
    LayerType::Relu,
    LayerType::Sigmoid,
    LayerType::Tanh,
    LayerType::Abs,
    LayerType::Neg,
    LayerType::FusedElementwise,
    LayerType::Convolution,
    LayerType::InnerProduct,
    LayerType::MatMul,
    LayerType::Lstm,
];

fn native_registrations(device_type: DeviceType) -> Vec<KernelRegistration> {
    let packed_kernel = |layer_type: LayerType,
                         promotion: &'static PromotionTable,
                         create: KernelCreator| KernelRegistration {
        layer_type,
        device_type,
        data_format: DataFormat::Nc4hw4,
        promotion,
        create,
    };
    let mut registrations: Vec<KernelRegistration> = [
        LayerType::Add,
        LayerType::Sub,
        LayerType::Mul,
        LayerType::Div,
        LayerType::Mod,
        LayerType::Maximum,
        LayerType::Minimum,
    ]
    .into_iter()
    .map(|t| packed_kernel(t, &tables::BINARY, packed::create_binary))
    .collect();
    registrations.extend(
        [
            LayerType::Relu,
            LayerType::Sigmoid,
            LayerType::Tanh,
            LayerType::Abs,
            LayerType::Neg,
        ]
        .into_iter()
        .map(|t| packed_kernel(t, &tables::FLOAT, packed::create_unary)),
    );
    registrations.push(packed_kernel(
        LayerType::FusedElementwise,
        &tables::FUSED,
        packed::create_fused,
    ));
    registrations.push(packed_kernel(LayerType::Convolution, &PACKED_F32, conv::create_conv));
    for (layer_type, create) in [
        (LayerType::InnerProduct, gemm::create_inner_product as KernelCreator),
        (LayerType::MatMul, gemm::create_matmul),
    ] {
        registrations.push(KernelRegistration {
            layer_type,
            device_type,
            data_format: DataFormat::Nchw,
            promotion: &tables::FLOAT,
            create,
        });
    }
    registrations
}

fn register_cpu_device(builder: &mut RegistryBuilder, device_type: DeviceType, name: &'static str) -> Result<()> {
    builder.register_device(Arc::new(HostDevice::new(
        device_type,
        name,
        host_capabilities(DataFormat::Nc4hw4),
    )))?;
    let native = native_registrations(device_type);
    let fallback = reference_registrations(device_type, NATIVE_LAYERS);
    builder.register_kernels(&native)?;
    builder.register_kernels(&fallback)?;
    tracing::debug!(
        device = %device_type,
        native = native.len(),
        fallback = fallback.len(),
        "registered faer cpu device without lstm"
    );
    Ok(())
}

/// Adds the `x86` and `arm` devices and their kernels to `builder`.
pub fn register_faer_backend(builder: &mut RegistryBuilder) -> Result<()> {
    register_cpu_device(builder, DeviceType::X86, "x86-faer")?;
    register_cpu_device(builder, DeviceType::Arm, "arm-faer")?;
    Ok(())
}

#[nnrt::linkme::distributed_slice(nnrt::registry::REGISTRARS)]
#[linkme(crate = nnrt::linkme)]
static REGISTER_FAER_BACKEND: Registrar = register_faer_backend;
