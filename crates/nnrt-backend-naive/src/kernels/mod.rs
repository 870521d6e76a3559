//! Reference kernels. Every kernel reads and writes logical NCHW values
//! through [`crate::host`], so it works on any host layout.

pub mod conv;
pub mod elementwise;
pub mod gather;
pub mod linear;
pub mod lstm;
pub mod shape;

use nnrt::layer::cast::PromotionTable;
use nnrt::layer::{KernelCreator, KernelRegistration, RawBuffer};
use nnrt::{DataFormat, DeviceType, LayerInfo, LayerType, Result, Status};

use crate::tables;

pub(crate) fn unexpected_param(layer: &LayerInfo) -> Status {
    Status::param(format!(
        "layer '{}' ({}) has {:?} parameters",
        layer.name,
        layer.layer_type,
        layer.param.kind()
    ))
}

/// Widens any numeric constant to `f32`.
pub fn raw_to_f32(raw: &RawBuffer) -> Result<Vec<f32>> {
    if raw.data_type().is_float() {
        raw.to_f32_vec()
    } else {
        Ok(raw.to_i64_vec()?.into_iter().map(|v| v as f32).collect())
    }
}

/// Integer constants as `i32`; values outside its range are an error.
pub fn raw_to_i32(raw: &RawBuffer) -> Result<Vec<i32>> {
    raw.to_i64_vec()?
        .into_iter()
        .map(|v| {
            i32::try_from(v).map_err(|_| Status::kernel(format!("constant {v} does not fit in i32")))
        })
        .collect()
}

/// `(layer, table, creator)` of every reference kernel.
pub static REFERENCE_KERNELS: &[(LayerType, &PromotionTable, KernelCreator)] = &[
    (LayerType::Add, &tables::BINARY, elementwise::create_binary),
    (LayerType::Sub, &tables::BINARY, elementwise::create_binary),
    (LayerType::Mul, &tables::BINARY, elementwise::create_binary),
    (LayerType::Div, &tables::BINARY, elementwise::create_binary),
    (LayerType::Mod, &tables::BINARY, elementwise::create_binary),
    (LayerType::Maximum, &tables::BINARY, elementwise::create_binary),
    (LayerType::Minimum, &tables::BINARY, elementwise::create_binary),
    (LayerType::Relu, &tables::FLOAT, elementwise::create_unary),
    (LayerType::Sigmoid, &tables::FLOAT, elementwise::create_unary),
    (LayerType::Tanh, &tables::FLOAT, elementwise::create_unary),
    (LayerType::Abs, &tables::FLOAT, elementwise::create_unary),
    (LayerType::Neg, &tables::FLOAT, elementwise::create_unary),
    (LayerType::FusedElementwise, &tables::FUSED, elementwise::create_fused),
    (LayerType::Convolution, &tables::FLOAT, conv::create_conv),
    (LayerType::InnerProduct, &tables::FLOAT, linear::create_inner_product),
    (LayerType::MatMul, &tables::FLOAT, linear::create_matmul),
    (LayerType::Gather, &tables::GATHER, gather::create_gather),
    (LayerType::Lstm, &tables::FLOAT, lstm::create_lstm),
    (LayerType::Concat, &tables::MOVE, shape::create_concat),
    (LayerType::Softmax, &tables::FLOAT, shape::create_softmax),
    (LayerType::Reshape, &tables::MOVE, shape::create_reshape),
    (LayerType::LayoutConvert, &tables::MOVE, shape::create_layout_convert),
];

/// Reference kernels bound to `device_type`, all reading NCHW, minus the
/// layers listed in `except`.
pub fn reference_registrations(
    device_type: DeviceType,
    except: &[LayerType],
) -> Vec<KernelRegistration> {
    REFERENCE_KERNELS
        .iter()
        .filter(|(layer_type, _, _)| !except.contains(layer_type))
        .map(|&(layer_type, promotion, create)| KernelRegistration {
            layer_type,
            device_type,
            data_format: DataFormat::Nchw,
            promotion,
            create,
        })
        .collect()
}
