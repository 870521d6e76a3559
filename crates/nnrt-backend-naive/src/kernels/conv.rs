//! Direct convolution.

use nnrt::layer::param::ConvParam;
use nnrt::layer::{KernelContext, LayerAcc};
use nnrt::{Blob, DeviceHandle, LayerParam, LayerResource, Result, Status};

use super::{raw_to_f32, unexpected_param};
use crate::host;

/// Filter and bias of a convolution, widened to `f32`.
#[derive(Debug, Clone)]
pub struct ConvWeights {
    pub param: ConvParam,
    /// `[oc, ic / group, kh, kw]`.
    pub filter: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

impl ConvWeights {
    pub fn from_context(cx: &KernelContext<'_>) -> Result<Self> {
        let LayerParam::Convolution(param) = &cx.layer.param else {
            return Err(unexpected_param(cx.layer));
        };
        let Some(LayerResource::Convolution(resource)) = cx.resource.map(|r| r.as_ref()) else {
            return Err(Status::param(format!(
                "convolution '{}' has no filter resource",
                cx.layer.name
            )));
        };
        if resource.quant.is_some() || resource.filter.is_quantized_storage() {
            return Err(Status::kernel(format!(
                "convolution '{}' still holds quantized weights",
                cx.layer.name
            )));
        }
        let bias = match (&resource.bias, param.has_bias) {
            (Some(bias), _) => Some(raw_to_f32(bias)?),
            (None, true) => {
                return Err(Status::param(format!(
                    "convolution '{}' declares a bias but the resource has none",
                    cx.layer.name
                )))
            }
            (None, false) => None,
        };
        if let Some(bias) = &bias {
            if bias.len() != param.output_channels {
                return Err(Status::param(format!(
                    "convolution '{}' bias has {} values for {} channels",
                    cx.layer.name,
                    bias.len(),
                    param.output_channels
                )));
            }
        }
        Ok(ConvWeights {
            param: *param,
            filter: raw_to_f32(&resource.filter)?,
            bias,
        })
    }
}

/// Geometry of one convolution call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub group: usize,
}

impl ConvGeometry {
    pub fn new(param: &ConvParam, input: &[usize], output: &[usize]) -> Result<Self> {
        let ([n, c, h, w], [on, oc, oh, ow]) = (input, output) else {
            return Err(Status::kernel(format!(
                "convolution needs rank-4 blobs, got {input:?} -> {output:?}"
            )));
        };
        if n != on || *oc != param.output_channels {
            return Err(Status::kernel(format!(
                "convolution output {output:?} does not match input {input:?}"
            )));
        }
        Ok(ConvGeometry {
            batch: *n,
            in_channels: *c,
            in_h: *h,
            in_w: *w,
            out_channels: *oc,
            out_h: *oh,
            out_w: *ow,
            group: param.group.max(1),
        })
    }

    pub fn in_per_group(&self) -> usize {
        self.in_channels / self.group
    }

    pub fn out_per_group(&self) -> usize {
        self.out_channels / self.group
    }

    /// Input row/column read by output position `o` and kernel tap `k`,
    /// or `None` inside the padding.
    pub fn source(o: usize, k: usize, stride: usize, dilation: usize, pad: usize, size: usize) -> Option<usize> {
        (o * stride + k * dilation)
            .checked_sub(pad)
            .filter(|&i| i < size)
    }
}

/// Reference NCHW convolution over logical `f32` buffers.
pub fn conv2d_nchw(weights: &ConvWeights, g: &ConvGeometry, input: &[f32]) -> Vec<f32> {
    let p = &weights.param;
    let [kh, kw] = p.kernel;
    let (icg, ocg) = (g.in_per_group(), g.out_per_group());
    let mut out = vec![0.0f32; g.batch * g.out_channels * g.out_h * g.out_w];
    for n in 0..g.batch {
        for oc in 0..g.out_channels {
            let group = oc / ocg;
            let bias = weights.bias.as_ref().map_or(0.0, |b| b[oc]);
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let mut acc = bias;
                    for icl in 0..icg {
                        let ic = group * icg + icl;
                        for ky in 0..kh {
                            let Some(iy) = ConvGeometry::source(oy, ky, p.stride[0], p.dilation[0], p.pads[0], g.in_h) else {
                                continue;
                            };
                            for kx in 0..kw {
                                let Some(ix) = ConvGeometry::source(ox, kx, p.stride[1], p.dilation[1], p.pads[2], g.in_w) else {
                                    continue;
                                };
                                let x = input[((n * g.in_channels + ic) * g.in_h + iy) * g.in_w + ix];
                                let w = weights.filter[((oc * icg + icl) * kh + ky) * kw + kx];
                                acc += x * w;
                            }
                        }
                    }
                    out[((n * g.out_channels + oc) * g.out_h + oy) * g.out_w + ox] = acc;
                }
            }
        }
    }
    out
}

struct ConvKernel {
    weights: ConvWeights,
}

impl LayerAcc for ConvKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return Err(Status::kernel("convolution needs one input and one output"));
        };
        let geometry = ConvGeometry::new(&self.weights.param, input.dims(), output.dims())?;
        let values = host::read_f32(input)?;
        let out = conv2d_nchw(&self.weights, &geometry, &values);
        host::write_f32(output, &out)
    }
}

pub fn create_conv(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(ConvKernel {
        weights: ConvWeights::from_context(cx)?,
    }))
}
