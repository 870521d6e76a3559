//! Elementwise kernels over packed `Nc4hw4` storage.
//!
//! The direct paths visit valid lanes only, so a padding lane never feeds a
//! computation (a zero in a padding lane never reaches `Div`). Broadcasts,
//! resource constants and non-`f32` blobs go through the logical path.

use nnrt::blob::layout::for_each_packed_lane;
use nnrt::layer::{KernelContext, LayerAcc};
use nnrt::{Blob, DataFormat, DataType, DeviceHandle, LayerParam, Result, Status};
use nnrt_backend_naive::host;
use nnrt_backend_naive::kernels::elementwise::{
    broadcast_binary, BinaryOp, BinaryOperands, FusedChain, FusedHead, UnaryOp,
};
use nnrt_backend_naive::kernels::raw_to_i32;

fn output(outputs: &[Blob]) -> Result<&Blob> {
    outputs
        .first()
        .ok_or_else(|| Status::kernel("elementwise layer has no output"))
}

/// True when every blob is packed `f32` with the output's dims.
fn direct(inputs: &[Blob], output: &Blob) -> bool {
    let packed_f32 = |b: &Blob| b.data_type() == DataType::Float32 && b.data_format() == DataFormat::Nc4hw4;
    packed_f32(output)
        && inputs
            .iter()
            .all(|b| packed_f32(b) && b.dims() == output.dims())
}

/// `dst[p] = f(lhs[p], rhs[p])` over valid lanes.
fn binary_lanes(inputs: &[Blob], out: &Blob, f: impl Fn(f32, f32) -> f32) -> Result<()> {
    let [a, b] = inputs else {
        return Err(Status::kernel("binary layer expects 2 inputs"));
    };
    // SAFETY: inputs and output of one layer occupy disjoint live ranges;
    // the inputs are only read.
    let (lhs, rhs, dst) = unsafe {
        (
            host::storage_f32(a)?,
            host::storage_f32(b)?,
            host::storage_f32_mut(out)?,
        )
    };
    for_each_packed_lane(out.dims(), |p, _, _, _| dst[p] = f(lhs[p], rhs[p]));
    Ok(())
}

/// `dst[p] = f(src[p])` over valid lanes.
fn unary_lanes(inputs: &[Blob], out: &Blob, f: impl Fn(f32) -> f32) -> Result<()> {
    let input = inputs
        .first()
        .ok_or_else(|| Status::kernel("elementwise layer has no input"))?;
    // SAFETY: see `binary_lanes`.
    let (src, dst) = unsafe { (host::storage_f32(input)?, host::storage_f32_mut(out)?) };
    for_each_packed_lane(out.dims(), |p, _, _, _| dst[p] = f(src[p]));
    Ok(())
}

struct PackedBinaryKernel {
    op: BinaryOp,
    operands: BinaryOperands,
    compute: DataType,
}

impl LayerAcc for PackedBinaryKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let out = output(outputs)?;
        let op = self.op;
        if !self.operands.has_constant() && direct(inputs, out) {
            return binary_lanes(inputs, out, |a, b| op.apply_f32(a, b));
        }
        if self.compute == DataType::Int32 {
            let (lhs, rhs) = self.operands.read(inputs, host::read_i32, raw_to_i32)?;
            let values = broadcast_binary(&lhs, &rhs, out.dims(), |a, b| op.apply_i32(a, b))?;
            return host::write_i32(out, &values);
        }
        let values = self.operands.eval_f32(op, inputs, out.dims())?;
        host::write_f32(out, &values)
    }
}

pub fn create_binary(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let (LayerParam::Elementwise(param), Some(op)) =
        (&cx.layer.param, BinaryOp::from_layer(cx.layer.layer_type))
    else {
        return Err(Status::param(format!(
            "layer '{}' is not a binary elementwise layer",
            cx.layer.name
        )));
    };
    Ok(Box::new(PackedBinaryKernel {
        op,
        operands: BinaryOperands::new(&cx.layer.name, *param, cx.resource.map(|r| r.as_ref()))?,
        compute: cx.promotion.compute,
    }))
}

struct PackedUnaryKernel {
    op: UnaryOp,
}

impl LayerAcc for PackedUnaryKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let out = output(outputs)?;
        let op = self.op;
        if direct(inputs, out) {
            return unary_lanes(inputs, out, |x| op.apply(x));
        }
        let input = inputs
            .first()
            .ok_or_else(|| Status::kernel("activation has no input"))?;
        let values: Vec<f32> = host::read_f32(input)?.into_iter().map(|x| op.apply(x)).collect();
        host::write_f32(out, &values)
    }
}

pub fn create_unary(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let op = UnaryOp::from_layer(cx.layer.layer_type).ok_or_else(|| {
        Status::param(format!("layer '{}' is not an activation", cx.layer.name))
    })?;
    Ok(Box::new(PackedUnaryKernel { op }))
}

struct PackedFusedKernel {
    chain: FusedChain,
}

impl LayerAcc for PackedFusedKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let out = output(outputs)?;
        let chain = &self.chain;
        if direct(inputs, out) {
            match &chain.head {
                FusedHead::Binary(op, operands) if !operands.has_constant() => {
                    let op = *op;
                    return binary_lanes(inputs, out, |a, b| chain.apply_tail(op.apply_f32(a, b)));
                }
                FusedHead::Unary(op) => {
                    let op = *op;
                    return unary_lanes(inputs, out, |x| chain.apply_tail(op.apply(x)));
                }
                FusedHead::Binary(..) => {}
            }
        }
        let values = chain.eval(inputs, out.dims())?;
        host::write_f32(out, &values)
    }
}

pub fn create_fused(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    if cx.promotion.compute != DataType::Float32 {
        return Err(Status::new(
            nnrt::ErrorKind::UnsupportedTypeCombination,
            format!("fused layer '{}' must compute in f32", cx.layer.name),
        ));
    }
    Ok(Box::new(PackedFusedKernel {
        chain: FusedChain::from_context(cx)?,
    }))
}
