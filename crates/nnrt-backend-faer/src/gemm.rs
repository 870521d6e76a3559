//! Matrix products through faer.

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::Accum;
use nnrt::layer::{KernelContext, LayerAcc};
use nnrt::{Blob, DeviceHandle, Result, Status};
use nnrt_backend_naive::host;
use nnrt_backend_naive::kernels::linear::{batched_matmul, InnerProductWeights, MatMulOperands};

use crate::faer_parallelism;

/// Row-major `out[m, n] = a[m, k] x b[k, n]`.
pub fn gemm_row_major(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        out.fill(0.0);
        return;
    }
    let a_view = MatRef::from_row_major_slice(a, m, k);
    let b_view = MatRef::from_row_major_slice(b, k, n);
    // C^T = B^T A^T written column-major (n x m) is C in row-major order.
    let mut out_view = MatMut::from_column_major_slice_mut(out, n, m);
    matmul(
        &mut out_view,
        Accum::Replace,
        b_view.transpose(),
        a_view.transpose(),
        1.0f32,
        faer_parallelism(),
    );
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
        let values = batched_matmul(&a, &b, output.dims(), gemm_row_major)?;
        host::write_f32(output, &values)
    }
}

pub fn create_matmul(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(MatMulKernel {
        operands: MatMulOperands::from_context(cx)?,
    }))
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
        let n = self.weights.num_output;
        if k * n != self.weights.weight.len() {
            return Err(Status::kernel(format!(
                "inner product input {:?} does not match weight of {} values",
                input.dims(),
                self.weights.weight.len()
            )));
        }
        let x = host::read_f32(input)?;
        let mut out = vec![0.0f32; rows * n];
        if rows > 0 && n > 0 && k > 0 {
            let x_view = MatRef::from_row_major_slice(&x, rows, k);
            let w_view = MatRef::from_row_major_slice(&self.weights.weight, n, k);
            // Y^T = W X^T, column-major (n x rows) is Y row-major.
            let mut out_view = MatMut::from_column_major_slice_mut(&mut out, n, rows);
            matmul(
                &mut out_view,
                Accum::Replace,
                w_view,
                x_view.transpose(),
                1.0f32,
                faer_parallelism(),
            );
        }
        if let Some(bias) = self.weights.bias.as_ref().filter(|_| n > 0) {
            for row in out.chunks_exact_mut(n) {
                for (v, b) in row.iter_mut().zip(bias) {
                    *v += b;
                }
            }
        }
        host::write_f32(output, &out)
    }
}

pub fn create_inner_product(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(InnerProductKernel {
        weights: InnerProductWeights::from_context(cx)?,
    }))
}
