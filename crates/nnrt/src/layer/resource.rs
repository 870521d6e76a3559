//! Learned constants attached to layers.

use half::{bf16, f16};

use super::layer_type::LayerType;
use crate::blob::dims;
use crate::blob::{DataType, DimsVector};
use crate::status::{Result, Status};

/// Typed host storage of a [`RawBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawData {
    Float32(Vec<f32>),
    Float16(Vec<f16>),
    BFloat16(Vec<bf16>),
    Int8(Vec<i8>),
    UInt8(Vec<u8>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
}

impl RawData {
    pub fn data_type(&self) -> DataType {
        match self {
            RawData::Float32(_) => DataType::Float32,
            RawData::Float16(_) => DataType::Float16,
            RawData::BFloat16(_) => DataType::BFloat16,
            RawData::Int8(_) => DataType::Int8,
            RawData::UInt8(_) => DataType::UInt8,
            RawData::Int32(_) => DataType::Int32,
            RawData::Int64(_) => DataType::Int64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawData::Float32(v) => v.len(),
            RawData::Float16(v) => v.len(),
            RawData::BFloat16(v) => v.len(),
            RawData::Int8(v) => v.len(),
            RawData::UInt8(v) => v.len(),
            RawData::Int32(v) => v.len(),
            RawData::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shaped constant tensor held on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBuffer {
    dims: DimsVector,
    data: RawData,
}

impl RawBuffer {
    pub fn new(dims: &[usize], data: RawData) -> Result<Self> {
        if dims::count(dims) != data.len() {
            return Err(Status::param(format!(
                "raw buffer dims {:?} describe {} elements, data holds {}",
                dims,
                dims::count(dims),
                data.len()
            )));
        }
        Ok(RawBuffer {
            dims: DimsVector::from_slice(dims),
            data,
        })
    }

    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> Result<Self> {
        Self::new(dims, RawData::Float32(values))
    }

    pub fn from_i8(dims: &[usize], values: Vec<i8>) -> Result<Self> {
        Self::new(dims, RawData::Int8(values))
    }

    pub fn from_i32(dims: &[usize], values: Vec<i32>) -> Result<Self> {
        Self::new(dims, RawData::Int32(values))
    }

    pub fn scalar_f32(value: f32) -> Self {
        RawBuffer {
            dims: DimsVector::from_slice(&[1]),
            data: RawData::Float32(vec![value]),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &RawData {
        &self.data
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            RawData::Float32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            RawData::Int32(v) => Some(v),
            _ => None,
        }
    }

    /// Widens floating-point data to `f32`. Integer data is refused; integer
    /// weights must go through dequantization.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match &self.data {
            RawData::Float32(v) => Ok(v.clone()),
            RawData::Float16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            RawData::BFloat16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            other => Err(Status::new(
                crate::status::ErrorKind::UnsupportedTypeCombination,
                format!("{} constant cannot be read as float32", other.data_type()),
            )),
        }
    }

    /// Integer values widened to `i64`; used for indices and zero points.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match &self.data {
            RawData::Int8(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            RawData::UInt8(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            RawData::Int32(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            RawData::Int64(v) => Ok(v.clone()),
            other => Err(Status::new(
                crate::status::ErrorKind::UnsupportedTypeCombination,
                format!("{} constant cannot be read as integers", other.data_type()),
            )),
        }
    }

    pub fn is_quantized_storage(&self) -> bool {
        matches!(self.data, RawData::Int8(_) | RawData::UInt8(_))
    }
}

/// Scale and zero point of quantized weights. One scale is per-tensor;
/// otherwise there is one scale per slice along `axis`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub scale: RawBuffer,
    pub zero_point: Option<RawBuffer>,
    pub axis: usize,
}

impl QuantParams {
    pub fn per_tensor(scale: f32, zero_point: Option<i32>) -> Self {
        QuantParams {
            scale: RawBuffer::scalar_f32(scale),
            zero_point: zero_point.map(|zp| RawBuffer {
                dims: DimsVector::from_slice(&[1]),
                data: RawData::Int32(vec![zp]),
            }),
            axis: 0,
        }
    }

    pub fn per_channel(scales: Vec<f32>, zero_points: Option<Vec<i32>>, axis: usize) -> Result<Self> {
        let n = scales.len();
        let zero_point = match zero_points {
            Some(zp) => Some(RawBuffer::from_i32(&[zp.len()], zp)?),
            None => None,
        };
        Ok(QuantParams {
            scale: RawBuffer::from_f32(&[n], scales)?,
            zero_point,
            axis,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvResource {
    /// `[output_channels, input_channels / group, kh, kw]`.
    pub filter: RawBuffer,
    pub bias: Option<RawBuffer>,
    pub quant: Option<QuantParams>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InnerProductResource {
    /// `[num_output, K]`.
    pub weight: RawBuffer,
    pub bias: Option<RawBuffer>,
    pub quant: Option<QuantParams>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatMulResource {
    pub weight: RawBuffer,
    pub quant: Option<QuantParams>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatherResource {
    pub data: Option<RawBuffer>,
    pub indices: Option<RawBuffer>,
    /// Applies to `data`.
    pub quant: Option<QuantParams>,
}

/// Gate order along the `4 * hidden` axis is input, output, forget, cell.
#[derive(Debug, Clone, PartialEq)]
pub struct LstmResource {
    /// `[4 * hidden, input_size]`.
    pub w: RawBuffer,
    /// `[4 * hidden, hidden]`.
    pub r: RawBuffer,
    /// `[8 * hidden]`: input bias followed by recurrent bias.
    pub bias: Option<RawBuffer>,
    pub w_quant: Option<QuantParams>,
    pub r_quant: Option<QuantParams>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementwiseResource {
    pub constant: RawBuffer,
    pub quant: Option<QuantParams>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerResource {
    Convolution(ConvResource),
    InnerProduct(InnerProductResource),
    MatMul(MatMulResource),
    Gather(GatherResource),
    Lstm(LstmResource),
    Elementwise(ElementwiseResource),
}

impl LayerResource {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LayerResource::Convolution(_) => "convolution",
            LayerResource::InnerProduct(_) => "inner_product",
            LayerResource::MatMul(_) => "matmul",
            LayerResource::Gather(_) => "gather",
            LayerResource::Lstm(_) => "lstm",
            LayerResource::Elementwise(_) => "elementwise",
        }
    }

    /// Whether this resource variant belongs to `layer_type`.
    pub fn fits(&self, layer_type: LayerType) -> bool {
        match self {
            LayerResource::Convolution(_) => layer_type == LayerType::Convolution,
            LayerResource::InnerProduct(_) => layer_type == LayerType::InnerProduct,
            LayerResource::MatMul(_) => layer_type == LayerType::MatMul,
            LayerResource::Gather(_) => layer_type == LayerType::Gather,
            LayerResource::Lstm(_) => layer_type == LayerType::Lstm,
            LayerResource::Elementwise(_) => {
                layer_type.is_binary_elementwise() || layer_type == LayerType::FusedElementwise
            }
        }
    }

    /// True if any weight is still stored quantized.
    pub fn is_quantized(&self) -> bool {
        match self {
            LayerResource::Convolution(r) => r.quant.is_some() || r.filter.is_quantized_storage(),
            LayerResource::InnerProduct(r) => r.quant.is_some() || r.weight.is_quantized_storage(),
            LayerResource::MatMul(r) => r.quant.is_some() || r.weight.is_quantized_storage(),
            LayerResource::Gather(r) => {
                r.quant.is_some()
                    || r.data.as_ref().is_some_and(RawBuffer::is_quantized_storage)
            }
            LayerResource::Lstm(r) => {
                r.w_quant.is_some()
                    || r.r_quant.is_some()
                    || r.w.is_quantized_storage()
                    || r.r.is_quantized_storage()
            }
            LayerResource::Elementwise(r) => {
                r.quant.is_some() || r.constant.is_quantized_storage()
            }
        }
    }
}
