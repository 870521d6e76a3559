use std::fmt;

use serde::{Deserialize, Serialize};

/// Operator kind of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerType {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Maximum,
    Minimum,
    Relu,
    Sigmoid,
    Tanh,
    Abs,
    Neg,
    Convolution,
    InnerProduct,
    MatMul,
    Gather,
    Lstm,
    Concat,
    Softmax,
    Reshape,
    /// Inserted by the layout pass.
    LayoutConvert,
    /// Inserted by the fusion pass.
    FusedElementwise,
}

/// Parameter schema expected for a layer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    None,
    Elementwise,
    Convolution,
    InnerProduct,
    MatMul,
    Gather,
    Lstm,
    Concat,
    Softmax,
    Reshape,
    LayoutConvert,
    FusedElementwise,
}

impl LayerType {
    pub const ALL: [LayerType; 22] = [
        LayerType::Add,
        LayerType::Sub,
        LayerType::Mul,
        LayerType::Div,
        LayerType::Mod,
        LayerType::Maximum,
        LayerType::Minimum,
        LayerType::Relu,
        LayerType::Sigmoid,
        LayerType::Tanh,
        LayerType::Abs,
        LayerType::Neg,
        LayerType::Convolution,
        LayerType::InnerProduct,
        LayerType::MatMul,
        LayerType::Gather,
        LayerType::Lstm,
        LayerType::Concat,
        LayerType::Softmax,
        LayerType::Reshape,
        LayerType::LayoutConvert,
        LayerType::FusedElementwise,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LayerType::Add => "Add",
            LayerType::Sub => "Sub",
            LayerType::Mul => "Mul",
            LayerType::Div => "Div",
            LayerType::Mod => "Mod",
            LayerType::Maximum => "Maximum",
            LayerType::Minimum => "Minimum",
            LayerType::Relu => "ReLU",
            LayerType::Sigmoid => "Sigmoid",
            LayerType::Tanh => "Tanh",
            LayerType::Abs => "Abs",
            LayerType::Neg => "Neg",
            LayerType::Convolution => "Convolution",
            LayerType::InnerProduct => "InnerProduct",
            LayerType::MatMul => "MatMul",
            LayerType::Gather => "Gather",
            LayerType::Lstm => "LSTM",
            LayerType::Concat => "Concat",
            LayerType::Softmax => "Softmax",
            LayerType::Reshape => "Reshape",
            LayerType::LayoutConvert => "LayoutConvert",
            LayerType::FusedElementwise => "FusedElementwise",
        }
    }

    pub fn is_binary_elementwise(self) -> bool {
        matches!(
            self,
            LayerType::Add
                | LayerType::Sub
                | LayerType::Mul
                | LayerType::Div
                | LayerType::Mod
                | LayerType::Maximum
                | LayerType::Minimum
        )
    }

    pub fn is_unary_activation(self) -> bool {
        matches!(
            self,
            LayerType::Relu | LayerType::Sigmoid | LayerType::Tanh | LayerType::Abs | LayerType::Neg
        )
    }

    pub fn is_elementwise(self) -> bool {
        self.is_binary_elementwise() || self.is_unary_activation()
    }

    pub fn param_kind(self) -> ParamKind {
        match self {
            t if t.is_binary_elementwise() => ParamKind::Elementwise,
            t if t.is_unary_activation() => ParamKind::None,
            LayerType::Convolution => ParamKind::Convolution,
            LayerType::InnerProduct => ParamKind::InnerProduct,
            LayerType::MatMul => ParamKind::MatMul,
            LayerType::Gather => ParamKind::Gather,
            LayerType::Lstm => ParamKind::Lstm,
            LayerType::Concat => ParamKind::Concat,
            LayerType::Softmax => ParamKind::Softmax,
            LayerType::Reshape => ParamKind::Reshape,
            LayerType::LayoutConvert => ParamKind::LayoutConvert,
            LayerType::FusedElementwise => ParamKind::FusedElementwise,
            _ => ParamKind::None,
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
