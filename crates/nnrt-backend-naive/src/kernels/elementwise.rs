//! Binary, unary and fused elementwise kernels.

use nnrt::blob::dims;
use nnrt::layer::cast::PromotionRule;
use nnrt::layer::param::ElementwiseParam;
use nnrt::layer::{KernelContext, LayerAcc, RawBuffer};
use nnrt::{Blob, DataType, DeviceHandle, LayerParam, LayerResource, LayerType, Result, Status};

use super::{raw_to_f32, raw_to_i32, unexpected_param};
use crate::host::{self, Operand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn from_layer(layer_type: LayerType) -> Option<Self> {
        Some(match layer_type {
            LayerType::Add => BinaryOp::Add,
            LayerType::Sub => BinaryOp::Sub,
            LayerType::Mul => BinaryOp::Mul,
            LayerType::Div => BinaryOp::Div,
            LayerType::Mod => BinaryOp::Mod,
            LayerType::Maximum => BinaryOp::Maximum,
            LayerType::Minimum => BinaryOp::Minimum,
            _ => return None,
        })
    }

    /// IEEE semantics; `Mod` is the truncated remainder (`fmod`).
    pub fn apply_f32(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Mod => a % b,
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Minimum => a.min(b),
        }
    }

    /// Wrapping arithmetic; division or remainder by zero is a kernel error.
    pub fn apply_i32(self, a: i32, b: i32) -> Result<i32> {
        Ok(match self {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return Err(Status::kernel("integer division by zero"));
                }
                a.wrapping_div(b)
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(Status::kernel("integer remainder by zero"));
                }
                a.wrapping_rem(b)
            }
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Minimum => a.min(b),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Relu,
    Sigmoid,
    Tanh,
    Abs,
    Neg,
}

impl UnaryOp {
    pub fn from_layer(layer_type: LayerType) -> Option<Self> {
        Some(match layer_type {
            LayerType::Relu => UnaryOp::Relu,
            LayerType::Sigmoid => UnaryOp::Sigmoid,
            LayerType::Tanh => UnaryOp::Tanh,
            LayerType::Abs => UnaryOp::Abs,
            LayerType::Neg => UnaryOp::Neg,
            _ => return None,
        })
    }

    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Neg => -x,
        }
    }
}

/// Applies `f` over the broadcast of `lhs` and `rhs` to `out_dims`.
pub fn broadcast_binary<T: Copy, U>(
    lhs: &Operand<T>,
    rhs: &Operand<T>,
    out_dims: &[usize],
    mut f: impl FnMut(T, T) -> Result<U>,
) -> Result<Vec<U>> {
    let rank = out_dims.len();
    if lhs.dims.len() > rank || rhs.dims.len() > rank {
        return Err(Status::kernel(format!(
            "operands {:?} and {:?} exceed output rank {rank}",
            lhs.dims, rhs.dims
        )));
    }
    let total = dims::count(out_dims);
    if lhs.dims.as_slice() == out_dims && rhs.dims.as_slice() == out_dims {
        return lhs
            .values
            .iter()
            .zip(&rhs.values)
            .map(|(&a, &b)| f(a, b))
            .collect();
    }
    let lhs_strides = dims::broadcast_strides(&lhs.dims, out_dims);
    let rhs_strides = dims::broadcast_strides(&rhs.dims, out_dims);
    let mut index = vec![0usize; rank];
    let mut out = Vec::with_capacity(total);
    for _ in 0..total {
        let (mut l, mut r) = (0, 0);
        for axis in 0..rank {
            l += index[axis] * lhs_strides[axis];
            r += index[axis] * rhs_strides[axis];
        }
        out.push(f(lhs.values[l], rhs.values[r])?);
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < out_dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Ok(out)
}

/// Blob inputs of a binary layer plus its optional resource constant.
#[derive(Debug, Clone)]
pub struct BinaryOperands {
    constant: Option<(usize, RawBuffer)>,
}

impl BinaryOperands {
    pub fn new(
        layer: &str,
        param: ElementwiseParam,
        resource: Option<&LayerResource>,
    ) -> Result<Self> {
        let constant = match param.constant_operand {
            None => None,
            Some(position) => match resource {
                Some(LayerResource::Elementwise(r)) => Some((position, r.constant.clone())),
                _ => {
                    return Err(Status::param(format!(
                        "layer '{layer}' has a constant operand but no elementwise resource"
                    )))
                }
            },
        };
        Ok(BinaryOperands { constant })
    }

    pub fn has_constant(&self) -> bool {
        self.constant.is_some()
    }

    pub fn read<T>(
        &self,
        inputs: &[Blob],
        read: fn(&Blob) -> Result<Vec<T>>,
        convert: fn(&RawBuffer) -> Result<Vec<T>>,
    ) -> Result<(Operand<T>, Operand<T>)> {
        match &self.constant {
            Some((position, buffer)) => {
                let input = inputs
                    .first()
                    .ok_or_else(|| Status::kernel("binary layer has no blob input"))?;
                let x = Operand::new(input.dims(), read(input)?)?;
                let k = Operand::new(buffer.dims(), convert(buffer)?)?;
                Ok(if *position == 0 { (k, x) } else { (x, k) })
            }
            None => {
                let [a, b] = inputs else {
                    return Err(Status::kernel(format!(
                        "binary layer expects 2 inputs, got {}",
                        inputs.len()
                    )));
                };
                Ok((
                    Operand::new(a.dims(), read(a)?)?,
                    Operand::new(b.dims(), read(b)?)?,
                ))
            }
        }
    }

    /// Evaluates `op` in `f32`.
    pub fn eval_f32(&self, op: BinaryOp, inputs: &[Blob], out_dims: &[usize]) -> Result<Vec<f32>> {
        let (lhs, rhs) = self.read(inputs, host::read_f32, raw_to_f32)?;
        broadcast_binary(&lhs, &rhs, out_dims, |a, b| Ok(op.apply_f32(a, b)))
    }
}

fn output(outputs: &[Blob]) -> Result<&Blob> {
    outputs
        .first()
        .ok_or_else(|| Status::kernel("elementwise layer has no output"))
}

struct BinaryKernel {
    op: BinaryOp,
    operands: BinaryOperands,
    compute: DataType,
}

impl LayerAcc for BinaryKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let out = output(outputs)?;
        match self.compute {
            DataType::Int32 => {
                let (lhs, rhs) = self.operands.read(inputs, host::read_i32, raw_to_i32)?;
                let op = self.op;
                let values = broadcast_binary(&lhs, &rhs, out.dims(), |a, b| op.apply_i32(a, b))?;
                host::write_i32(out, &values)
            }
            _ => {
                let values = self.operands.eval_f32(self.op, inputs, out.dims())?;
                host::write_f32(out, &values)
            }
        }
    }
}

pub fn create_binary(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let LayerParam::Elementwise(param) = &cx.layer.param else {
        return Err(unexpected_param(cx.layer));
    };
    let op = BinaryOp::from_layer(cx.layer.layer_type)
        .ok_or_else(|| unexpected_param(cx.layer))?;
    Ok(Box::new(BinaryKernel {
        op,
        operands: BinaryOperands::new(&cx.layer.name, *param, cx.resource.map(|r| r.as_ref()))?,
        compute: cx.promotion.compute,
    }))
}

struct UnaryKernel {
    op: UnaryOp,
}

impl LayerAcc for UnaryKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let input = inputs
            .first()
            .ok_or_else(|| Status::kernel("activation has no input"))?;
        let mut values = host::read_f32(input)?;
        for v in &mut values {
            *v = self.op.apply(*v);
        }
        host::write_f32(output(outputs)?, &values)
    }
}

pub fn create_unary(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let op = UnaryOp::from_layer(cx.layer.layer_type).ok_or_else(|| unexpected_param(cx.layer))?;
    Ok(Box::new(UnaryKernel { op }))
}

/// Head of a fused chain.
#[derive(Debug, Clone)]
pub enum FusedHead {
    Binary(BinaryOp, BinaryOperands),
    Unary(UnaryOp),
}

/// A parsed fused chain: the head op followed by unary tail ops.
#[derive(Debug, Clone)]
pub struct FusedChain {
    pub head: FusedHead,
    pub tail: Vec<UnaryOp>,
}

impl FusedChain {
    pub fn from_context(cx: &KernelContext<'_>) -> Result<Self> {
        let LayerParam::FusedElementwise(param) = &cx.layer.param else {
            return Err(unexpected_param(cx.layer));
        };
        let head = match (BinaryOp::from_layer(param.head), UnaryOp::from_layer(param.head)) {
            (Some(op), _) => FusedHead::Binary(
                op,
                BinaryOperands::new(
                    &cx.layer.name,
                    param.head_param,
                    cx.resource.map(|r| r.as_ref()),
                )?,
            ),
            (None, Some(op)) => FusedHead::Unary(op),
            (None, None) => {
                return Err(Status::param(format!(
                    "layer '{}' fuses non-elementwise head {}",
                    cx.layer.name, param.head
                )))
            }
        };
        let tail = param
            .tail
            .iter()
            .map(|t| {
                UnaryOp::from_layer(*t).ok_or_else(|| {
                    Status::param(format!("layer '{}' fuses non-activation {t}", cx.layer.name))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FusedChain { head, tail })
    }

    pub fn apply_tail(&self, x: f32) -> f32 {
        self.tail.iter().fold(x, |acc, op| op.apply(acc))
    }

    /// Logical NCHW result of the whole chain.
    pub fn eval(&self, inputs: &[Blob], out_dims: &[usize]) -> Result<Vec<f32>> {
        let mut values = match &self.head {
            FusedHead::Binary(op, operands) => operands.eval_f32(*op, inputs, out_dims)?,
            FusedHead::Unary(op) => {
                let input = inputs
                    .first()
                    .ok_or_else(|| Status::kernel("fused layer has no input"))?;
                let mut values = host::read_f32(input)?;
                for v in &mut values {
                    *v = op.apply(*v);
                }
                values
            }
        };
        for v in &mut values {
            *v = self.apply_tail(*v);
        }
        Ok(values)
    }
}

struct FusedKernel {
    chain: FusedChain,
}

impl LayerAcc for FusedKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let out = output(outputs)?;
        let values = self.chain.eval(inputs, out.dims())?;
        host::write_f32(out, &values)
    }
}

pub fn create_fused(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    check_float_compute(cx.promotion, &cx.layer.name)?;
    Ok(Box::new(FusedKernel {
        chain: FusedChain::from_context(cx)?,
    }))
}

fn check_float_compute(rule: &PromotionRule, layer: &str) -> Result<()> {
    if rule.compute != DataType::Float32 {
        return Err(Status::new(
            nnrt::ErrorKind::UnsupportedTypeCombination,
            format!("layer '{layer}' computes in {}, fused kernels need f32", rule.compute),
        ));
    }
    Ok(())
}
