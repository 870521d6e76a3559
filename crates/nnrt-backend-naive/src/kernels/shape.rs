//! Concat, softmax, reshape and layout conversion.

use nnrt::blob::dims::{self, normalize_axis};
use nnrt::layer::{KernelContext, LayerAcc};
use nnrt::{Blob, DeviceHandle, LayerParam, Result, Status};

use super::unexpected_param;
use crate::host;

struct ConcatKernel {
    axis: i64,
}

impl LayerAcc for ConcatKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let output = outputs
            .first()
            .ok_or_else(|| Status::kernel("concat has no output"))?;
        let out_dims = output.dims();
        let axis = normalize_axis(self.axis, out_dims.len())
            .ok_or_else(|| Status::kernel(format!("concat axis {} out of range", self.axis)))?;
        let element_size = output.data_type().size_in_bytes();
        let outer = dims::count_range(out_dims, 0, axis);
        let parts = inputs
            .iter()
            .map(|blob| {
                if blob.data_type() != output.data_type() {
                    return Err(Status::kernel(format!(
                        "concat input '{}' is {}, output is {}",
                        blob.name(),
                        blob.data_type(),
                        output.data_type()
                    )));
                }
                let chunk = dims::count_range(blob.dims(), axis, blob.dims().len()) * element_size;
                Ok((chunk, host::read_bytes(blob)?))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut out = Vec::with_capacity(output.desc().count() * element_size);
        for o in 0..outer {
            for (chunk, bytes) in &parts {
                out.extend_from_slice(&bytes[o * chunk..(o + 1) * chunk]);
            }
        }
        host::write_bytes(output, &out)
    }
}

pub fn create_concat(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let LayerParam::Concat(param) = &cx.layer.param else {
        return Err(unexpected_param(cx.layer));
    };
    Ok(Box::new(ConcatKernel { axis: param.axis }))
}

/// Numerically stable softmax of `values` along `axis` of `dims`.
pub fn softmax(values: &mut [f32], dims: &[usize], axis: usize) {
    let outer = dims::count_range(dims, 0, axis);
    let len = dims[axis];
    let inner = dims::count_range(dims, axis + 1, dims.len());
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| (o * len + k) * inner + i;
            let max = (0..len).map(|k| values[at(k)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for k in 0..len {
                let e = (values[at(k)] - max).exp();
                values[at(k)] = e;
                sum += e;
            }
            for k in 0..len {
                values[at(k)] /= sum;
            }
        }
    }
}

struct SoftmaxKernel {
    axis: i64,
}

impl LayerAcc for SoftmaxKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return Err(Status::kernel("softmax needs one input and one output"));
        };
        let axis = normalize_axis(self.axis, input.dims().len())
            .ok_or_else(|| Status::kernel(format!("softmax axis {} out of range", self.axis)))?;
        let mut values = host::read_f32(input)?;
        softmax(&mut values, input.dims(), axis);
        host::write_f32(output, &values)
    }
}

pub fn create_softmax(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let LayerParam::Softmax(param) = &cx.layer.param else {
        return Err(unexpected_param(cx.layer));
    };
    Ok(Box::new(SoftmaxKernel { axis: param.axis }))
}

/// Reshape keeps the logical element order, so it is a plain copy.
struct ReshapeKernel;

impl LayerAcc for ReshapeKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return Err(Status::kernel("reshape needs one input and one output"));
        };
        host::write_bytes(output, &host::read_bytes(input)?)
    }
}

pub fn create_reshape(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let LayerParam::Reshape(_) = &cx.layer.param else {
        return Err(unexpected_param(cx.layer));
    };
    Ok(Box::new(ReshapeKernel))
}

/// Delegates to the device's converter; source and target formats come
/// from the blobs.
struct LayoutConvertKernel;

impl LayerAcc for LayoutConvertKernel {
    fn forward(&mut self, device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return Err(Status::kernel("layout conversion needs one input and one output"));
        };
        device
            .device()
            .convert_layout(device.context().as_ref(), input, output)
    }
}

pub fn create_layout_convert(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let LayerParam::LayoutConvert(param) = &cx.layer.param else {
        return Err(unexpected_param(cx.layer));
    };
    let (Some(input), Some(output)) = (cx.inputs.first(), cx.outputs.first()) else {
        return Err(Status::param(format!(
            "layout conversion '{}' needs one input and one output",
            cx.layer.name
        )));
    };
    if input.data_format != param.src_format || output.data_format != param.dst_format {
        return Err(Status::unsupported_format(format!(
            "layout conversion '{}' declared {} -> {}, blobs are {} -> {}",
            cx.layer.name, param.src_format, param.dst_format, input.data_format, output.data_format
        )));
    }
    Ok(Box::new(LayoutConvertKernel))
}
