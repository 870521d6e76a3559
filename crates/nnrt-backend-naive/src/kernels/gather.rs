//! Gather along one axis.

use nnrt::blob::dims::{self, normalize_axis};
use nnrt::layer::cast::write_from_f32;
use nnrt::layer::param::GatherParam;
use nnrt::layer::{KernelContext, LayerAcc, RawBuffer, RawData};
use nnrt::{Blob, DataType, DeviceHandle, DimsVector, LayerParam, LayerResource, Result, Status};

use super::unexpected_param;
use crate::host;

/// Resource-held data stored as bytes of the kernel's output type.
#[derive(Debug, Clone)]
struct ConstData {
    dims: DimsVector,
    bytes: Vec<u8>,
}

struct GatherKernel {
    param: GatherParam,
    data: Option<ConstData>,
    indices: Option<Vec<i64>>,
}

impl GatherKernel {
    fn new(cx: &KernelContext<'_>) -> Result<Self> {
        let LayerParam::Gather(param) = &cx.layer.param else {
            return Err(unexpected_param(cx.layer));
        };
        let resource = match cx.resource.map(|r| r.as_ref()) {
            Some(LayerResource::Gather(r)) => Some(r),
            _ => None,
        };
        let missing = |what: &str| {
            Status::param(format!("gather '{}' has no {what} in its resource", cx.layer.name))
        };
        let data = if param.data_in_resource {
            let raw = resource.and_then(|r| r.data.as_ref()).ok_or_else(|| missing("data"))?;
            Some(const_data(raw, cx.promotion.output)?)
        } else {
            None
        };
        let indices = if param.indices_in_resource {
            let raw = resource
                .and_then(|r| r.indices.as_ref())
                .ok_or_else(|| missing("indices"))?;
            Some(raw.to_i64_vec()?)
        } else {
            None
        };
        Ok(GatherKernel {
            param: *param,
            data,
            indices,
        })
    }
}

fn const_data(raw: &RawBuffer, output: DataType) -> Result<ConstData> {
    let dims = DimsVector::from_slice(raw.dims());
    if raw.data_type() == output {
        let bytes: Vec<u8> = match raw.data() {
            RawData::Float32(v) => bytemuck::cast_slice::<f32, u8>(v).to_vec(),
            RawData::Int32(v) => bytemuck::cast_slice::<i32, u8>(v).to_vec(),
            RawData::Int64(v) => bytemuck::cast_slice::<i64, u8>(v).to_vec(),
            RawData::Int8(v) => v.iter().map(|&b| b as u8).collect(),
            RawData::UInt8(v) => v.clone(),
            RawData::Float16(v) => v.iter().flat_map(|h| h.to_ne_bytes()).collect(),
            RawData::BFloat16(v) => v.iter().flat_map(|h| h.to_ne_bytes()).collect(),
        };
        return Ok(ConstData { dims, bytes });
    }
    let values: Vec<f32> = match raw.data_type() {
        t if t.is_float() => raw.to_f32_vec()?,
        _ => raw.to_i64_vec()?.into_iter().map(|v| v as f32).collect(),
    };
    let mut bytes = vec![0u8; values.len() * output.size_in_bytes()];
    write_from_f32(&values, output, &mut bytes)?;
    Ok(ConstData { dims, bytes })
}

/// Copies slices of `data` selected by `indices` along `axis`. Negative
/// indices count from the end; anything else out of range is an error.
pub fn gather_bytes(
    data: &[u8],
    data_dims: &[usize],
    indices: &[i64],
    axis: usize,
    element_size: usize,
) -> Result<Vec<u8>> {
    let outer = dims::count_range(data_dims, 0, axis);
    let axis_len = data_dims[axis];
    let inner = dims::count_range(data_dims, axis + 1, data_dims.len()) * element_size;
    let mut out = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &raw in indices {
            let index = if raw < 0 { raw + axis_len as i64 } else { raw };
            if index < 0 || index >= axis_len as i64 {
                return Err(Status::kernel(format!(
                    "gather index {raw} out of range for axis of length {axis_len}"
                )));
            }
            let start = (o * axis_len + index as usize) * inner;
            out.extend_from_slice(&data[start..start + inner]);
        }
    }
    Ok(out)
}

impl LayerAcc for GatherKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let output = outputs
            .first()
            .ok_or_else(|| Status::kernel("gather has no output"))?;
        let mut blobs = inputs.iter();
        let (data_dims, data) = match &self.data {
            Some(c) => (c.dims.clone(), c.bytes.clone()),
            None => {
                let blob = blobs
                    .next()
                    .ok_or_else(|| Status::kernel("gather data input missing"))?;
                if blob.data_type() != output.data_type() {
                    return Err(Status::kernel(format!(
                        "gather data is {}, output is {}",
                        blob.data_type(),
                        output.data_type()
                    )));
                }
                (DimsVector::from_slice(blob.dims()), host::read_bytes(blob)?)
            }
        };
        let indices: Vec<i64> = match &self.indices {
            Some(values) => values.clone(),
            None => {
                let blob = blobs
                    .next()
                    .ok_or_else(|| Status::kernel("gather indices input missing"))?;
                host::read_i32(blob)?.into_iter().map(i64::from).collect()
            }
        };
        let axis = normalize_axis(self.param.axis, data_dims.len()).ok_or_else(|| {
            Status::kernel(format!("gather axis {} out of range", self.param.axis))
        })?;
        let bytes = gather_bytes(&data, &data_dims, &indices, axis, output.data_type().size_in_bytes())?;
        host::write_bytes(output, &bytes)
    }
}

pub fn create_gather(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(GatherKernel::new(cx)?))
}
