//! Static per-layer parameters.

use super::layer_type::{LayerType, ParamKind};
use crate::blob::DataFormat;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum LayerParam {
    #[default]
    None,
    Elementwise(ElementwiseParam),
    Convolution(ConvParam),
    InnerProduct(InnerProductParam),
    MatMul(MatMulParam),
    Gather(GatherParam),
    Lstm(LstmParam),
    Concat(ConcatParam),
    Softmax(SoftmaxParam),
    Reshape(ReshapeParam),
    LayoutConvert(LayoutConvertParam),
    FusedElementwise(FusedElementwiseParam),
}

impl LayerParam {
    pub fn kind(&self) -> ParamKind {
        match self {
            LayerParam::None => ParamKind::None,
            LayerParam::Elementwise(_) => ParamKind::Elementwise,
            LayerParam::Convolution(_) => ParamKind::Convolution,
            LayerParam::InnerProduct(_) => ParamKind::InnerProduct,
            LayerParam::MatMul(_) => ParamKind::MatMul,
            LayerParam::Gather(_) => ParamKind::Gather,
            LayerParam::Lstm(_) => ParamKind::Lstm,
            LayerParam::Concat(_) => ParamKind::Concat,
            LayerParam::Softmax(_) => ParamKind::Softmax,
            LayerParam::Reshape(_) => ParamKind::Reshape,
            LayerParam::LayoutConvert(_) => ParamKind::LayoutConvert,
            LayerParam::FusedElementwise(_) => ParamKind::FusedElementwise,
        }
    }
}

/// Binary elementwise layer. When `constant_operand` is set the layer has a
/// single blob input and the other operand is the resource constant at that
/// position (0 = left, 1 = right).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementwiseParam {
    pub constant_operand: Option<usize>,
}

/// 2-D convolution over NCHW input. `pads` is `[top, bottom, left, right]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParam {
    pub output_channels: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pads: [usize; 4],
    pub dilation: [usize; 2],
    pub group: usize,
    pub has_bias: bool,
}

impl ConvParam {
    pub fn new(output_channels: usize, kernel: [usize; 2]) -> Self {
        ConvParam {
            output_channels,
            kernel,
            stride: [1, 1],
            pads: [0; 4],
            dilation: [1, 1],
            group: 1,
            has_bias: false,
        }
    }
}

/// Fully connected layer: input is flattened from `axis`, weight is
/// `[num_output, K]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerProductParam {
    pub num_output: usize,
    pub has_bias: bool,
    pub axis: usize,
}

/// With `weight_position` set, the resource weight takes that operand slot
/// and the layer has one blob input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatMulParam {
    pub weight_position: Option<usize>,
}

/// Gather along `axis`. Either operand may come from the layer resource;
/// an embedding lookup keeps the table in the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherParam {
    pub axis: i64,
    pub data_in_resource: bool,
    pub indices_in_resource: bool,
}

/// Unidirectional LSTM, input `[seq, batch, input_size]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LstmParam {
    pub hidden_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatParam {
    pub axis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftmaxParam {
    pub axis: i64,
}

/// Target shape; `0` copies the input dim, `-1` is inferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapeParam {
    pub shape: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutConvertParam {
    pub src_format: DataFormat,
    pub dst_format: DataFormat,
}

/// A chain of elementwise layers run as one kernel: `head` first, then each
/// unary op in `tail` on the running result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedElementwiseParam {
    pub head: LayerType,
    pub head_param: ElementwiseParam,
    pub tail: Vec<LayerType>,
    /// Names of the layers that were merged, head first.
    pub fused_layers: Vec<String>,
}
