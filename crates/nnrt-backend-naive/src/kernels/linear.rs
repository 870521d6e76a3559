//! Inner product and batched matrix multiplication.

use nnrt::blob::dims;
use nnrt::layer::{KernelContext, LayerAcc};
use nnrt::{Blob, DeviceHandle, LayerParam, LayerResource, Result, Status};

use super::{raw_to_f32, unexpected_param};
use crate::host::{self, Operand};

/// Weight `[num_output, k]` and bias of an inner product, in `f32`.
#[derive(Debug, Clone)]
pub struct InnerProductWeights {
    pub num_output: usize,
    pub axis: usize,
    pub weight: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

impl InnerProductWeights {
    pub fn from_context(cx: &KernelContext<'_>) -> Result<Self> {
        let LayerParam::InnerProduct(param) = &cx.layer.param else {
            return Err(unexpected_param(cx.layer));
        };
        let Some(LayerResource::InnerProduct(resource)) = cx.resource.map(|r| r.as_ref()) else {
            return Err(Status::param(format!(
                "inner product '{}' has no weight resource",
                cx.layer.name
            )));
        };
        if resource.quant.is_some() || resource.weight.is_quantized_storage() {
            return Err(Status::kernel(format!(
                "inner product '{}' still holds quantized weights",
                cx.layer.name
            )));
        }
        let bias = resource.bias.as_ref().map(raw_to_f32).transpose()?;
        if param.has_bias && bias.is_none() {
            return Err(Status::param(format!(
                "inner product '{}' declares a bias but the resource has none",
                cx.layer.name
            )));
        }
        Ok(InnerProductWeights {
            num_output: param.num_output,
            axis: param.axis,
            weight: raw_to_f32(&resource.weight)?,
            bias,
        })
    }

    /// `(rows, k)` of the flattened input.
    pub fn rows_and_depth(&self, input: &[usize]) -> (usize, usize) {
        (
            dims::count_range(input, 0, self.axis),
            dims::count_range(input, self.axis, input.len()),
        )
    }
}

/// `y[m, n] = sum_k x[m, k] * w[n, k] + b[n]`.
pub fn inner_product(weights: &InnerProductWeights, input: &[f32], rows: usize, k: usize) -> Vec<f32> {
    let n_out = weights.num_output;
    let mut out = vec![0.0f32; rows * n_out];
    for m in 0..rows {
        let x = &input[m * k..(m + 1) * k];
        for n in 0..n_out {
            let w = &weights.weight[n * k..(n + 1) * k];
            let dot: f32 = x.iter().zip(w).map(|(a, b)| a * b).sum();
            out[m * n_out + n] = dot + weights.bias.as_ref().map_or(0.0, |b| b[n]);
        }
    }
    out
}

struct InnerProductKernel {
    weights: InnerProductWeights,
}

impl LayerAcc for InnerProductKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let (Some(input), Some(output)) = (inputs.first(), outputs.first()) else {
            return Err(Status::kernel("inner product needs one input and one output"));
        };
        let (rows, k) = self.weights.rows_and_depth(input.dims());
        if k * self.weights.num_output != self.weights.weight.len() {
            return Err(Status::kernel(format!(
                "inner product input {:?} does not match weight of {} values",
                input.dims(),
                self.weights.weight.len()
            )));
        }
        let values = host::read_f32(input)?;
        host::write_f32(output, &inner_product(&self.weights, &values, rows, k))
    }
}

pub fn create_inner_product(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(InnerProductKernel {
        weights: InnerProductWeights::from_context(cx)?,
    }))
}

/// Operands of a matmul: both from blobs, or one fixed weight.
#[derive(Debug, Clone)]
pub struct MatMulOperands {
    /// `(position, weight)` when one side is a constant.
    weight: Option<(usize, Operand<f32>)>,
}

impl MatMulOperands {
    pub fn from_context(cx: &KernelContext<'_>) -> Result<Self> {
        let LayerParam::MatMul(param) = &cx.layer.param else {
            return Err(unexpected_param(cx.layer));
        };
        let weight = match param.weight_position {
            None => None,
            Some(position) => {
                let Some(LayerResource::MatMul(resource)) = cx.resource.map(|r| r.as_ref()) else {
                    return Err(Status::param(format!(
                        "matmul '{}' has a weight position but no weight",
                        cx.layer.name
                    )));
                };
                if resource.quant.is_some() || resource.weight.is_quantized_storage() {
                    return Err(Status::kernel(format!(
                        "matmul '{}' still holds quantized weights",
                        cx.layer.name
                    )));
                }
                let values = raw_to_f32(&resource.weight)?;
                Some((position, Operand::new(resource.weight.dims(), values)?))
            }
        };
        Ok(MatMulOperands { weight })
    }

    pub fn read(&self, inputs: &[Blob]) -> Result<(Operand<f32>, Operand<f32>)> {
        let blob = |b: &Blob| -> Result<Operand<f32>> { Operand::new(b.dims(), host::read_f32(b)?) };
        match (&self.weight, inputs) {
            (Some((0, w)), [x]) => Ok((w.clone(), blob(x)?)),
            (Some((_, w)), [x]) => Ok((blob(x)?, w.clone())),
            (None, [a, b]) => Ok((blob(a)?, blob(b)?)),
            _ => Err(Status::kernel(format!(
                "matmul got {} blob inputs",
                inputs.len()
            ))),
        }
    }
}

/// Batched `a @ b` with numpy broadcasting over the batch axes.
/// `matrix` computes one `[m, k] x [k, n]` product into `out`.
pub fn batched_matmul(
    a: &Operand<f32>,
    b: &Operand<f32>,
    out_dims: &[usize],
    mut matrix: impl FnMut(&[f32], &[f32], &mut [f32], usize, usize, usize),
) -> Result<Vec<f32>> {
    let (ar, br, or) = (a.dims.len(), b.dims.len(), out_dims.len());
    if ar < 2 || br < 2 || or < 2 {
        return Err(Status::kernel("matmul operands must be at least rank 2"));
    }
    let (m, k, n) = (a.dims[ar - 2], a.dims[ar - 1], b.dims[br - 1]);
    if b.dims[br - 2] != k || out_dims[or - 2] != m || out_dims[or - 1] != n {
        return Err(Status::kernel(format!(
            "matmul {:?} x {:?} -> {out_dims:?} is inconsistent",
            a.dims, b.dims
        )));
    }
    let batch_dims = &out_dims[..or - 2];
    let a_batch = &a.dims[..ar - 2];
    let b_batch = &b.dims[..br - 2];
    if a_batch.len() > batch_dims.len() || b_batch.len() > batch_dims.len() {
        return Err(Status::kernel("matmul batch rank exceeds output rank"));
    }
    let a_strides = dims::broadcast_strides(a_batch, batch_dims);
    let b_strides = dims::broadcast_strides(b_batch, batch_dims);
    let batches = dims::count(batch_dims);
    let mut out = vec![0.0f32; batches * m * n];
    let mut index = vec![0usize; batch_dims.len()];
    for batch in 0..batches {
        let (mut ai, mut bi) = (0, 0);
        for axis in 0..batch_dims.len() {
            ai += index[axis] * a_strides[axis];
            bi += index[axis] * b_strides[axis];
        }
        matrix(
            &a.values[ai * m * k..(ai + 1) * m * k],
            &b.values[bi * k * n..(bi + 1) * k * n],
            &mut out[batch * m * n..(batch + 1) * m * n],
            m,
            k,
            n,
        );
        for axis in (0..batch_dims.len()).rev() {
            index[axis] += 1;
            if index[axis] < batch_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok(out)
}

/// Row-major `[m, k] x [k, n]`.
pub fn matmul_naive(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            out[i * n + j] = acc;
        }
    }
}

struct MatMulKernel {
    operands: MatMulOperands,
}

impl LayerAcc for MatMulKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let output = outputs
            .first()
            .ok_or_else(|| Status::kernel("matmul has no output"))?;
        let (a, b) = self.operands.read(inputs)?;
        let values = batched_matmul(&a, &b, output.dims(), matmul_naive)?;
        host::write_f32(output, &values)
    }
}

pub fn create_matmul(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(MatMulKernel {
        operands: MatMulOperands::from_context(cx)?,
    }))
}
