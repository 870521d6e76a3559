//! Convolution over packed `Nc4hw4` blobs via im2col and faer GEMM.

use std::cell::RefCell;

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::Accum;
use nnrt::blob::layout::PackedGeometry;
use nnrt::layer::{KernelContext, LayerAcc};
use nnrt::{Blob, DataFormat, DeviceHandle, Result, Status};
use nnrt_backend_naive::host;
use nnrt_backend_naive::kernels::conv::{ConvGeometry, ConvWeights};

use crate::faer_parallelism;

thread_local! {
    static IM2COL_SCRATCH_F32: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
    static GEMM_SCRATCH_F32: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
}

/// Convolution of packed `input` into packed `output`.
///
/// Per batch and group the patches form a `[oh * ow, icg * kh * kw]`
/// matrix that is multiplied by the group's filter rows. Only valid output
/// lanes are written.
pub fn conv2d_nc4hw4(
    weights: &ConvWeights,
    g: &ConvGeometry,
    input: &[f32],
    output: &mut [f32],
) -> Result<()> {
    let p = &weights.param;
    let [kh, kw] = p.kernel;
    let (icg, ocg) = (g.in_per_group(), g.out_per_group());
    let depth = icg * kh * kw;
    let positions = g.out_h * g.out_w;
    let in_geo = PackedGeometry::from_dims(&[g.batch, g.in_channels, g.in_h, g.in_w]);
    let out_geo = PackedGeometry::from_dims(&[g.batch, g.out_channels, g.out_h, g.out_w]);
    if input.len() < in_geo.packed_len() || output.len() < out_geo.packed_len() {
        return Err(Status::kernel("packed convolution buffers are too small"));
    }
    if positions == 0 || ocg == 0 {
        return Ok(());
    }

    IM2COL_SCRATCH_F32.with(|cols| {
        GEMM_SCRATCH_F32.with(|gemm| {
            let mut cols = cols.borrow_mut();
            let mut gemm = gemm.borrow_mut();
            cols.clear();
            cols.resize(positions * depth, 0.0);
            gemm.clear();
            gemm.resize(positions * ocg, 0.0);

            for n in 0..g.batch {
                for group in 0..g.group {
                    for oy in 0..g.out_h {
                        for ox in 0..g.out_w {
                            let row = &mut cols[(oy * g.out_w + ox) * depth..][..depth];
                            let mut col = 0;
                            for icl in 0..icg {
                                let ic = group * icg + icl;
                                for ky in 0..kh {
                                    let iy = ConvGeometry::source(oy, ky, p.stride[0], p.dilation[0], p.pads[0], g.in_h);
                                    for kx in 0..kw {
                                        let ix = ConvGeometry::source(ox, kx, p.stride[1], p.dilation[1], p.pads[2], g.in_w);
                                        row[col] = match (iy, ix) {
                                            (Some(iy), Some(ix)) => input[in_geo.packed_offset(n, ic, iy * g.in_w + ix)],
                                            _ => 0.0,
                                        };
                                        col += 1;
                                    }
                                }
                            }
                        }
                    }

                    if depth > 0 {
                        let filter = &weights.filter[group * ocg * depth..(group + 1) * ocg * depth];
                        let w_view = MatRef::from_row_major_slice(filter, ocg, depth);
                        let col_view = MatRef::from_row_major_slice(cols.as_slice(), positions, depth);
                        // Column-major (ocg x positions) is row-major [positions, ocg].
                        let mut out_view = MatMut::from_column_major_slice_mut(gemm.as_mut_slice(), ocg, positions);
                        matmul(
                            &mut out_view,
                            Accum::Replace,
                            w_view,
                            col_view.transpose(),
                            1.0f32,
                            faer_parallelism(),
                        );
                    } else {
                        gemm.fill(0.0);
                    }

                    for ocl in 0..ocg {
                        let oc = group * ocg + ocl;
                        let bias = weights.bias.as_ref().map_or(0.0, |b| b[oc]);
                        for s in 0..positions {
                            output[out_geo.packed_offset(n, oc, s)] = gemm[s * ocg + ocl] + bias;
                        }
                    }
                }
            }
        })
    });
    Ok(())
}

struct PackedConvKernel {
    weights: ConvWeights,
}

impl LayerAcc for PackedConvKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return Err(Status::kernel("convolution needs one input and one output"));
        };
        if input.data_format() != DataFormat::Nc4hw4 || output.data_format() != DataFormat::Nc4hw4 {
            return Err(Status::unsupported_format(format!(
                "packed convolution got {} -> {}",
                input.data_format(),
                output.data_format()
            )));
        }
        let geometry = ConvGeometry::new(&self.weights.param, input.dims(), output.dims())?;
        // SAFETY: input and output of one layer occupy disjoint live ranges.
        let (src, dst) = unsafe { (host::storage_f32(input)?, host::storage_f32_mut(output)?) };
        conv2d_nc4hw4(&self.weights, &geometry, src, dst)
    }
}

pub fn create_conv(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let weights = ConvWeights::from_context(cx)?;
    let depth = weights.param.kernel[0] * weights.param.kernel[1];
    if weights.filter.len() != weights.param.output_channels * depth * filter_in_channels(cx)? {
        return Err(Status::param(format!(
            "convolution '{}' filter size does not match its parameters",
            cx.layer.name
        )));
    }
    Ok(Box::new(PackedConvKernel { weights }))
}

fn filter_in_channels(cx: &KernelContext<'_>) -> Result<usize> {
    let input = cx
        .inputs
        .first()
        .ok_or_else(|| Status::param(format!("convolution '{}' has no input", cx.layer.name)))?;
    let group = match &cx.layer.param {
        nnrt::LayerParam::Convolution(p) => p.group.max(1),
        _ => 1,
    };
    input
        .dims
        .get(1)
        .map(|c| c / group)
        .ok_or_else(|| Status::param(format!("convolution '{}' input is not NCHW", cx.layer.name)))
}
