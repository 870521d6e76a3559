//! Elementwise `f32` kernels written directly in PTX.
//!
//! Binary kernels need operands of the output's exact shape; broadcasting
//! and constant operands are not supported on this device.

use std::ffi::c_void;
use std::fmt::Write as _;
use std::sync::OnceLock;

use nnrt::layer::cast::{PromotionRule, PromotionTable};
use nnrt::layer::{KernelContext, KernelCreator, KernelRegistration, LayerAcc};
use nnrt::{Blob, DataFormat, DataType, DeviceHandle, DeviceType, LayerParam, LayerType, Result, Status};

use crate::device::{blob_ptr, cuda_context, CudaContext};

const BLOCK: u32 = 256;

pub static CUDA_F32: PromotionTable = PromotionTable {
    name: "cuda_f32",
    rules: &[PromotionRule::uniform(DataType::Float32, DataType::Float32, DataType::Float32)],
};

const BINARY_OPS: &[(LayerType, &str, &str)] = &[
    (LayerType::Add, "nnrt_add_f32", "add.f32 \t%f3, %f1, %f2;"),
    (LayerType::Sub, "nnrt_sub_f32", "sub.f32 \t%f3, %f1, %f2;"),
    (LayerType::Mul, "nnrt_mul_f32", "mul.f32 \t%f3, %f1, %f2;"),
    (LayerType::Div, "nnrt_div_f32", "div.rn.f32 \t%f3, %f1, %f2;"),
    (LayerType::Maximum, "nnrt_max_f32", "max.f32 \t%f3, %f1, %f2;"),
    (LayerType::Minimum, "nnrt_min_f32", "min.f32 \t%f3, %f1, %f2;"),
];

// sigmoid(x) = 1 / (1 + 2^(-x * log2(e))), tanh(x) = 2 * sigmoid(2x) - 1
const UNARY_OPS: &[(LayerType, &str, &str)] = &[
    (LayerType::Relu, "nnrt_relu_f32", "max.f32 \t%f3, %f1, 0f00000000;"),
    (LayerType::Abs, "nnrt_abs_f32", "abs.f32 \t%f3, %f1;"),
    (LayerType::Neg, "nnrt_neg_f32", "neg.f32 \t%f3, %f1;"),
    (
        LayerType::Sigmoid,
        "nnrt_sigmoid_f32",
        "mul.f32 \t%f2, %f1, 0fBFB8AA3B;\n\tex2.approx.f32 \t%f2, %f2;\n\tadd.f32 \t%f2, %f2, 0f3F800000;\n\trcp.rn.f32 \t%f3, %f2;",
    ),
    (
        LayerType::Tanh,
        "nnrt_tanh_f32",
        "mul.f32 \t%f2, %f1, 0fC038AA3B;\n\tex2.approx.f32 \t%f2, %f2;\n\tadd.f32 \t%f2, %f2, 0f3F800000;\n\trcp.rn.f32 \t%f2, %f2;\n\tfma.rn.f32 \t%f3, %f2, 0f40000000, 0fBF800000;",
    ),
];

fn binary_symbol(layer_type: LayerType) -> Option<&'static str> {
    BINARY_OPS
        .iter()
        .find(|(t, _, _)| *t == layer_type)
        .map(|(_, symbol, _)| *symbol)
}

fn unary_symbol(layer_type: LayerType) -> Option<&'static str> {
    UNARY_OPS
        .iter()
        .find(|(t, _, _)| *t == layer_type)
        .map(|(_, symbol, _)| *symbol)
}

/// Source of the module loaded into every CUDA context.
pub(crate) fn ptx_module() -> &'static str {
    static MODULE: OnceLock<String> = OnceLock::new();
    MODULE.get_or_init(|| {
        let mut ptx = String::from(".version 6.0\n.target sm_50\n.address_size 64\n");
        for (_, name, op) in BINARY_OPS {
            let _ = write!(
                ptx,
                "
.visible .entry {name}(
\t.param .u64 {name}_lhs,
\t.param .u64 {name}_rhs,
\t.param .u64 {name}_out,
\t.param .u32 {name}_n
)
{{
\t.reg .pred \t%p<2>;
\t.reg .b32 \t%r<6>;
\t.reg .f32 \t%f<4>;
\t.reg .b64 \t%rd<11>;

\tld.param.u64 \t%rd1, [{name}_lhs];
\tld.param.u64 \t%rd2, [{name}_rhs];
\tld.param.u64 \t%rd3, [{name}_out];
\tld.param.u32 \t%r1, [{name}_n];
\tmov.u32 \t%r2, %ctaid.x;
\tmov.u32 \t%r3, %ntid.x;
\tmov.u32 \t%r4, %tid.x;
\tmad.lo.s32 \t%r5, %r2, %r3, %r4;
\tsetp.ge.u32 \t%p1, %r5, %r1;
\t@%p1 bra \t$L__{name}_done;
\tcvta.to.global.u64 \t%rd4, %rd1;
\tcvta.to.global.u64 \t%rd5, %rd2;
\tcvta.to.global.u64 \t%rd6, %rd3;
\tmul.wide.u32 \t%rd7, %r5, 4;
\tadd.s64 \t%rd8, %rd4, %rd7;
\tadd.s64 \t%rd9, %rd5, %rd7;
\tadd.s64 \t%rd10, %rd6, %rd7;
\tld.global.f32 \t%f1, [%rd8];
\tld.global.f32 \t%f2, [%rd9];
\t{op}
\tst.global.f32 \t[%rd10], %f3;
$L__{name}_done:
\tret;
}}
"
            );
        }
        for (_, name, op) in UNARY_OPS {
            let _ = write!(
                ptx,
                "
.visible .entry {name}(
\t.param .u64 {name}_in,
\t.param .u64 {name}_out,
\t.param .u32 {name}_n
)
{{
\t.reg .pred \t%p<2>;
\t.reg .b32 \t%r<6>;
\t.reg .f32 \t%f<4>;
\t.reg .b64 \t%rd<8>;

\tld.param.u64 \t%rd1, [{name}_in];
\tld.param.u64 \t%rd2, [{name}_out];
\tld.param.u32 \t%r1, [{name}_n];
\tmov.u32 \t%r2, %ctaid.x;
\tmov.u32 \t%r3, %ntid.x;
\tmov.u32 \t%r4, %tid.x;
\tmad.lo.s32 \t%r5, %r2, %r3, %r4;
\tsetp.ge.u32 \t%p1, %r5, %r1;
\t@%p1 bra \t$L__{name}_done;
\tcvta.to.global.u64 \t%rd3, %rd1;
\tcvta.to.global.u64 \t%rd4, %rd2;
\tmul.wide.u32 \t%rd5, %r5, 4;
\tadd.s64 \t%rd6, %rd3, %rd5;
\tadd.s64 \t%rd7, %rd4, %rd5;
\tld.global.f32 \t%f1, [%rd6];
\t{op}
\tst.global.f32 \t[%rd7], %f3;
$L__{name}_done:
\tret;
}}
"
            );
        }
        ptx
    })
}

fn cuda(device: &DeviceHandle) -> Result<&CudaContext> {
    cuda_context(device.context().as_ref())
}

fn element_count(blob: &Blob) -> Result<u32> {
    u32::try_from(blob.desc().count()).map_err(|_| {
        Status::kernel(format!(
            "blob '{}' has too many elements for one launch",
            blob.name()
        ))
    })
}

fn launch(cuda: &CudaContext, function: usize, n: u32, args: &[u64]) -> Result<()> {
    if n == 0 {
        return Ok(());
    }
    let mut pointers = args.to_vec();
    let mut count = n;
    let mut params: Vec<*mut c_void> = pointers
        .iter_mut()
        .map(|p| p as *mut u64 as *mut c_void)
        .collect();
    params.push(&mut count as *mut u32 as *mut c_void);
    let grid = n.div_ceil(BLOCK);
    cuda.enter()?
        .launch_kernel(function, grid, BLOCK, cuda.stream(), &mut params)
}

fn output(outputs: &[Blob]) -> Result<&Blob> {
    outputs
        .first()
        .ok_or_else(|| Status::kernel("elementwise layer has no output"))
}

fn check_same_shape(layer: &str, inputs: &[&[usize]], output: &[usize]) -> Result<()> {
    if inputs.iter().any(|dims| *dims != output) {
        return Err(Status::device_not_supported(
            DeviceType::Cuda,
            &format!("broadcasting elementwise operands in layer '{layer}'"),
        ));
    }
    Ok(())
}

/// First op of a kernel: a binary op over two blobs or a unary op.
#[derive(Debug, Clone, Copy)]
enum Head {
    Binary(usize),
    Unary(usize),
}

struct ElementwiseKernel {
    layer: String,
    head: Head,
    tail: Vec<usize>,
}

impl ElementwiseKernel {
    fn create(cx: &KernelContext<'_>, head: LayerType, constant: Option<usize>, tail: &[LayerType]) -> Result<Self> {
        let cuda = cuda(cx.device)?;
        let name = &cx.layer.name;
        if constant.is_some() {
            return Err(Status::device_not_supported(
                DeviceType::Cuda,
                &format!("constant elementwise operands in layer '{name}'"),
            ));
        }
        let head = match (binary_symbol(head), unary_symbol(head)) {
            (Some(symbol), _) => Head::Binary(cuda.function(symbol)?),
            (None, Some(symbol)) => Head::Unary(cuda.function(symbol)?),
            (None, None) => {
                return Err(Status::param(format!(
                    "layer '{name}' is not elementwise: {head}"
                )))
            }
        };
        let tail = tail
            .iter()
            .map(|t| {
                let symbol = unary_symbol(*t).ok_or_else(|| {
                    Status::param(format!("layer '{name}' fuses non-activation {t}"))
                })?;
                cuda.function(symbol)
            })
            .collect::<Result<Vec<_>>>()?;
        let kernel = ElementwiseKernel {
            layer: name.clone(),
            head,
            tail,
        };
        let inputs: Vec<&[usize]> = cx.inputs.iter().map(|d| d.dims.as_slice()).collect();
        let out = cx
            .outputs
            .first()
            .ok_or_else(|| Status::kernel("elementwise layer has no output"))?;
        kernel.check(&inputs, &out.dims)?;
        Ok(kernel)
    }

    fn check(&self, inputs: &[&[usize]], output: &[usize]) -> Result<()> {
        let arity = match self.head {
            Head::Binary(_) => 2,
            Head::Unary(_) => 1,
        };
        if inputs.len() != arity {
            return Err(Status::kernel(format!(
                "layer '{}' expects {arity} inputs, got {}",
                self.layer,
                inputs.len()
            )));
        }
        check_same_shape(&self.layer, inputs, output)
    }
}

impl LayerAcc for ElementwiseKernel {
    fn reshape(&mut self, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let dims: Vec<&[usize]> = inputs.iter().map(|b| b.dims()).collect();
        self.check(&dims, output(outputs)?.dims())
    }

    fn forward(&mut self, device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let cuda = cuda(device)?;
        let out = output(outputs)?;
        let n = element_count(out)?;
        let dst = blob_ptr(out)?;
        match (self.head, inputs) {
            (Head::Binary(function), [a, b]) => {
                launch(cuda, function, n, &[blob_ptr(a)?, blob_ptr(b)?, dst])?
            }
            (Head::Unary(function), [x]) => launch(cuda, function, n, &[blob_ptr(x)?, dst])?,
            _ => {
                return Err(Status::kernel(format!(
                    "layer '{}' got {} inputs",
                    self.layer,
                    inputs.len()
                )))
            }
        }
        for function in &self.tail {
            launch(cuda, *function, n, &[dst, dst])?;
        }
        Ok(())
    }
}

fn create_elementwise(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let constant = match &cx.layer.param {
        LayerParam::Elementwise(param) => param.constant_operand,
        _ => None,
    };
    Ok(Box::new(ElementwiseKernel::create(
        cx,
        cx.layer.layer_type,
        constant,
        &[],
    )?))
}

fn create_fused(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    let LayerParam::FusedElementwise(param) = &cx.layer.param else {
        return Err(Status::param(format!(
            "layer '{}' lacks fused elementwise parameters",
            cx.layer.name
        )));
    };
    Ok(Box::new(ElementwiseKernel::create(
        cx,
        param.head,
        param.head_param.constant_operand,
        &param.tail,
    )?))
}

/// Reshape only relabels dims, so the kernel is a device copy.
struct ReshapeKernel;

impl LayerAcc for ReshapeKernel {
    fn forward(&mut self, device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let (Some(input), Some(out)) = (inputs.first(), outputs.first()) else {
            return Err(Status::kernel("reshape needs one input and one output"));
        };
        let bytes = out.desc().byte_size();
        if input.desc().byte_size() != bytes {
            return Err(Status::kernel(format!(
                "reshape '{}' changes the byte size",
                out.name()
            )));
        }
        let cuda = cuda(device)?;
        let (src, dst) = (blob_ptr(input)?, blob_ptr(out)?);
        cuda.enter()?.copy_async(dst, src, bytes, cuda.stream())
    }
}

fn create_reshape(_cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(ReshapeKernel))
}

pub fn cuda_registrations() -> Vec<KernelRegistration> {
    let registration = |layer_type: LayerType, create: KernelCreator| KernelRegistration {
        layer_type,
        device_type: DeviceType::Cuda,
        data_format: DataFormat::Nchw,
        promotion: &CUDA_F32,
        create,
    };
    BINARY_OPS
        .iter()
        .chain(UNARY_OPS)
        .map(|(layer_type, _, _)| registration(*layer_type, create_elementwise))
        .chain([
            registration(LayerType::FusedElementwise, create_fused),
            registration(LayerType::Reshape, create_reshape),
        ])
        .collect()
}
