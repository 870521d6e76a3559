//! Small graphs used by the scenarios.

use nnrt::layer::param::{
    ConcatParam, ConvParam, ElementwiseParam, GatherParam, InnerProductParam, MatMulParam,
    SoftmaxParam,
};
use nnrt::layer::resource::{ConvResource, GatherResource, InnerProductResource};
use nnrt::layer::{QuantParams, RawBuffer};
use nnrt::{DataType, Graph, LayerInfo, LayerParam, LayerResource, LayerType, NetResource, NetStructure};

/// Param a plain elementwise layer of `layer_type` carries.
pub fn elementwise_param(layer_type: LayerType) -> LayerParam {
    if layer_type.is_binary_elementwise() {
        LayerParam::Elementwise(ElementwiseParam::default())
    } else {
        LayerParam::None
    }
}

/// `out = op(a, b)`.
pub fn binary(layer_type: LayerType, dims: &[usize]) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("a", dims, DataType::Float32)
        .add_input("b", dims, DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            layer_type,
            "op",
            &["a", "b"],
            &["out"],
            elementwise_param(layer_type),
        ));
    Graph::new(structure, NetResource::default())
}

/// `out = ops[n-1](...ops[1](ops[0](a, b)))`; `ops[0]` is binary, the rest
/// are activations. Intermediates are `t0`, `t1`, ...
pub fn binary_then_activations(head: LayerType, tail: &[LayerType], dims: &[usize]) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("a", dims, DataType::Float32)
        .add_input("b", dims, DataType::Float32)
        .add_output("out");
    let names: Vec<String> = (0..tail.len()).map(|i| format!("t{i}")).collect();
    let first_out = names.first().map_or("out", String::as_str);
    structure.push_layer(LayerInfo::new(
        head,
        "head",
        &["a", "b"],
        &[first_out],
        elementwise_param(head),
    ));
    for (i, op) in tail.iter().enumerate() {
        let output = if i + 1 == tail.len() { "out" } else { names[i + 1].as_str() };
        structure.push_layer(LayerInfo::new(
            *op,
            format!("act{i}"),
            &[names[i].as_str()],
            &[output],
            LayerParam::None,
        ));
    }
    Graph::new(structure, NetResource::default())
}

/// `out = ops[n-1](...ops[0](x))`. Intermediates are `t0`, `t1`, ...
pub fn activation_chain(ops: &[LayerType], dims: &[usize]) -> Graph {
    let mut structure = NetStructure::default();
    structure.add_input("x", dims, DataType::Float32).add_output("out");
    let mut current = "x".to_string();
    for (i, op) in ops.iter().enumerate() {
        let output = if i + 1 == ops.len() {
            "out".to_string()
        } else {
            format!("t{i}")
        };
        structure.push_layer(LayerInfo::new(
            *op,
            format!("act{i}"),
            &[current.as_str()],
            &[output.as_str()],
            LayerParam::None,
        ));
        current = output;
    }
    Graph::new(structure, NetResource::default())
}

/// Convolution weights in float or int8 form.
pub enum ConvWeights {
    Float {
        filter: Vec<f32>,
        bias: Option<Vec<f32>>,
    },
    /// Per-output-channel scales, no zero point.
    Int8 {
        filter: Vec<i8>,
        scales: Vec<f32>,
        bias: Option<Vec<f32>>,
    },
}

/// `out = conv(x)` on an NCHW input of `dims`.
pub fn convolution(param: ConvParam, dims: &[usize], weights: ConvWeights) -> Graph {
    let in_per_group = dims[1] / param.group;
    let filter_dims = [param.output_channels, in_per_group, param.kernel[0], param.kernel[1]];
    let (filter, bias, quant) = match weights {
        ConvWeights::Float { filter, bias } => (
            RawBuffer::from_f32(&filter_dims, filter),
            bias,
            None,
        ),
        ConvWeights::Int8 {
            filter,
            scales,
            bias,
        } => (
            RawBuffer::from_i8(&filter_dims, filter),
            bias,
            QuantParams::per_channel(scales, None, 0).ok(),
        ),
    };
    let resource = ConvResource {
        filter: filter.unwrap_or_else(|err| panic!("filter buffer: {err}")),
        bias: bias.map(|b| {
            RawBuffer::from_f32(&[param.output_channels], b)
                .unwrap_or_else(|err| panic!("bias buffer: {err}"))
        }),
        quant,
    };
    let mut structure = NetStructure::default();
    structure
        .add_input("x", dims, DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Convolution,
            "conv",
            &["x"],
            &["out"],
            LayerParam::Convolution(param),
        ));
    let mut resources = NetResource::default();
    resources.insert("conv", LayerResource::Convolution(resource));
    Graph::new(structure, resources)
}

/// `out = x · W^T + bias` with `x` flattened from axis 1.
pub fn inner_product(dims: &[usize], num_output: usize, weight: Vec<f32>, bias: Vec<f32>) -> Graph {
    let depth: usize = dims[1..].iter().product();
    let resource = InnerProductResource {
        weight: RawBuffer::from_f32(&[num_output, depth], weight)
            .unwrap_or_else(|err| panic!("weight buffer: {err}")),
        bias: Some(
            RawBuffer::from_f32(&[num_output], bias)
                .unwrap_or_else(|err| panic!("bias buffer: {err}")),
        ),
        quant: None,
    };
    let mut structure = NetStructure::default();
    structure
        .add_input("x", dims, DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::InnerProduct,
            "fc",
            &["x"],
            &["out"],
            LayerParam::InnerProduct(InnerProductParam {
                num_output,
                has_bias: true,
                axis: 1,
            }),
        ));
    let mut resources = NetResource::default();
    resources.insert("fc", LayerResource::InnerProduct(resource));
    Graph::new(structure, resources)
}

/// `out = a @ b` over two blob inputs.
pub fn matmul(a_dims: &[usize], b_dims: &[usize]) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("a", a_dims, DataType::Float32)
        .add_input("b", b_dims, DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::MatMul,
            "matmul",
            &["a", "b"],
            &["out"],
            LayerParam::MatMul(MatMulParam::default()),
        ));
    Graph::new(structure, NetResource::default())
}

pub fn softmax(dims: &[usize], axis: i64) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("x", dims, DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Softmax,
            "softmax",
            &["x"],
            &["out"],
            LayerParam::Softmax(SoftmaxParam { axis }),
        ));
    Graph::new(structure, NetResource::default())
}

pub fn concat(a_dims: &[usize], b_dims: &[usize], axis: i64) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("a", a_dims, DataType::Float32)
        .add_input("b", b_dims, DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Concat,
            "concat",
            &["a", "b"],
            &["out"],
            LayerParam::Concat(ConcatParam { axis }),
        ));
    Graph::new(structure, NetResource::default())
}

/// Embedding lookup: `table` `[rows, width]` lives in the resource, the
/// `ids` input holds `i32` row indices.
pub fn embedding(rows: usize, width: usize, table: Vec<f32>, ids: usize) -> Graph {
    let resource = GatherResource {
        data: Some(
            RawBuffer::from_f32(&[rows, width], table)
                .unwrap_or_else(|err| panic!("table buffer: {err}")),
        ),
        indices: None,
        quant: None,
    };
    let mut structure = NetStructure::default();
    structure
        .add_input("ids", &[ids], DataType::Int32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Gather,
            "embedding",
            &["ids"],
            &["out"],
            LayerParam::Gather(GatherParam {
                axis: 0,
                data_in_resource: true,
                indices_in_resource: false,
            }),
        ));
    let mut resources = NetResource::default();
    resources.insert("embedding", LayerResource::Gather(resource));
    Graph::new(structure, resources)
}
