//! Forward shape and data-type propagation over a structure.

use std::collections::BTreeMap;

use smallvec::smallvec;

use crate::blob::dims::{self, broadcast, normalize_axis};
use crate::blob::{DataType, DimsVector};
use crate::device::DeviceType;
use crate::graph::{LayerInfo, NetResource, NetStructure};
use crate::layer::cast::PromotionRule;
use crate::layer::param::{ConvParam, ElementwiseParam, GatherParam, InnerProductParam};
use crate::layer::{LayerParam, LayerResource, LayerType};
use crate::registry::Registry;
use crate::status::{Result, Status};

/// Derives every tensor's dims from `input_shapes` and static parameters.
pub fn infer_shapes(
    structure: &NetStructure,
    resource: &NetResource,
    input_shapes: &BTreeMap<String, DimsVector>,
) -> Result<BTreeMap<String, DimsVector>> {
    let mut shapes = input_shapes.clone();
    for name in structure.inputs_shape_map.keys() {
        if !shapes.contains_key(name) {
            return Err(Status::shape_inference(name, "graph input has no shape"));
        }
    }
    for layer in &structure.layers {
        let mut inputs: Vec<&[usize]> = Vec::with_capacity(layer.inputs.len());
        for name in &layer.inputs {
            let dims = shapes.get(name).ok_or_else(|| {
                Status::shape_inference(&layer.name, format!("input '{name}' has no shape"))
            })?;
            inputs.push(dims.as_slice());
        }
        let layer_resource = resource.get(&layer.name).map(|r| r.as_ref());
        let outputs = infer_layer(layer, layer_resource, &inputs)?;
        if outputs.len() < layer.outputs.len() {
            return Err(Status::shape_inference(
                &layer.name,
                format!("{} outputs declared, {} derived", layer.outputs.len(), outputs.len()),
            ));
        }
        for (name, dims) in layer.outputs.iter().zip(outputs) {
            shapes.insert(name.clone(), dims);
        }
    }
    Ok(shapes)
}

/// Output dims of one layer.
pub fn infer_layer(
    layer: &LayerInfo,
    resource: Option<&LayerResource>,
    inputs: &[&[usize]],
) -> Result<Vec<DimsVector>> {
    let fail = |msg: String| Status::shape_inference(&layer.name, msg);
    let first = || first_input(layer, inputs);

    let out = match (&layer.layer_type, &layer.param) {
        (t, LayerParam::Elementwise(p)) if t.is_binary_elementwise() => {
            vec![binary_shape(layer, *p, resource, inputs)?]
        }
        (LayerType::FusedElementwise, LayerParam::FusedElementwise(p)) => {
            if p.head.is_binary_elementwise() {
                vec![binary_shape(layer, p.head_param, resource, inputs)?]
            } else {
                vec![DimsVector::from_slice(first()?)]
            }
        }
        (t, _) if t.is_unary_activation() => vec![DimsVector::from_slice(first()?)],
        (LayerType::LayoutConvert, _) => vec![DimsVector::from_slice(first()?)],
        (LayerType::Softmax, LayerParam::Softmax(p)) => {
            let input = first()?;
            normalize_axis(p.axis, input.len())
                .ok_or_else(|| fail(format!("axis {} out of range for rank {}", p.axis, input.len())))?;
            vec![DimsVector::from_slice(input)]
        }
        (LayerType::Convolution, LayerParam::Convolution(p)) => {
            vec![conv_shape(layer, p, resource, first()?)?]
        }
        (LayerType::InnerProduct, LayerParam::InnerProduct(p)) => {
            vec![inner_product_shape(layer, p, resource, first()?)?]
        }
        (LayerType::MatMul, LayerParam::MatMul(p)) => {
            let weight = match resource {
                Some(LayerResource::MatMul(r)) => Some(r.weight.dims()),
                _ => None,
            };
            let (a, b) = match (p.weight_position, weight) {
                (Some(0), Some(w)) => (w, first()?),
                (Some(_), Some(w)) => (first()?, w),
                (Some(_), None) => return Err(fail("matmul weight missing".to_string())),
                (None, _) => {
                    if inputs.len() != 2 {
                        return Err(fail("matmul needs two inputs".to_string()));
                    }
                    (inputs[0], inputs[1])
                }
            };
            vec![matmul_shape(a, b).map_err(fail)?]
        }
        (LayerType::Gather, LayerParam::Gather(p)) => vec![gather_shape(layer, p, resource, inputs)?],
        (LayerType::Lstm, LayerParam::Lstm(p)) => lstm_shapes(layer, p.hidden_size, resource, inputs)?,
        (LayerType::Concat, LayerParam::Concat(p)) => {
            let rank = first()?.len();
            let axis = normalize_axis(p.axis, rank)
                .ok_or_else(|| fail(format!("axis {} out of range for rank {rank}", p.axis)))?;
            let mut out = DimsVector::from_slice(inputs[0]);
            for input in &inputs[1..] {
                if input.len() != rank {
                    return Err(fail(format!("rank mismatch {rank} vs {}", input.len())));
                }
                for (d, (&a, &b)) in inputs[0].iter().zip(input.iter()).enumerate() {
                    if d != axis && a != b {
                        return Err(fail(format!("dim {d} differs: {a} vs {b}")));
                    }
                }
                out[axis] += input[axis];
            }
            vec![out]
        }
        (LayerType::Reshape, LayerParam::Reshape(p)) => vec![reshape_shape(first()?, &p.shape).map_err(fail)?],
        _ => {
            return Err(fail(format!(
                "no shape rule for {} with {:?} parameters",
                layer.layer_type,
                layer.param.kind()
            )))
        }
    };
    Ok(out)
}

fn first_input<'a>(layer: &LayerInfo, inputs: &[&'a [usize]]) -> Result<&'a [usize]> {
    inputs
        .first()
        .copied()
        .ok_or_else(|| Status::shape_inference(&layer.name, "missing input"))
}

fn binary_shape(
    layer: &LayerInfo,
    param: ElementwiseParam,
    resource: Option<&LayerResource>,
    inputs: &[&[usize]],
) -> Result<DimsVector> {
    let (a, b): (&[usize], &[usize]) = match param.constant_operand {
        Some(pos) => {
            let constant = match resource {
                Some(LayerResource::Elementwise(r)) => r.constant.dims(),
                _ => return Err(Status::shape_inference(&layer.name, "constant operand missing")),
            };
            let input = inputs
                .first()
                .copied()
                .ok_or_else(|| Status::shape_inference(&layer.name, "missing input"))?;
            if pos == 0 {
                (constant, input)
            } else {
                (input, constant)
            }
        }
        None => match inputs {
            [a, b] => (*a, *b),
            _ => return Err(Status::shape_inference(&layer.name, "expected two inputs")),
        },
    };
    broadcast(a, b).ok_or_else(|| {
        Status::shape_inference(&layer.name, format!("cannot broadcast {a:?} with {b:?}"))
    })
}

fn conv_shape(
    layer: &LayerInfo,
    p: &ConvParam,
    resource: Option<&LayerResource>,
    input: &[usize],
) -> Result<DimsVector> {
    let fail = |msg: String| Status::shape_inference(&layer.name, msg);
    let Some(LayerResource::Convolution(r)) = resource else {
        return Err(fail("convolution filter missing".to_string()));
    };
    if input.len() != 4 {
        return Err(fail(format!("convolution input must be NCHW, got {input:?}")));
    }
    let filter = r.filter.dims();
    if filter.len() != 4 {
        return Err(fail(format!("filter must be rank 4, got {filter:?}")));
    }
    let group = p.group.max(1);
    if filter[0] != p.output_channels || p.output_channels % group != 0 {
        return Err(fail(format!(
            "filter {filter:?} does not match {} output channels in {group} groups",
            p.output_channels
        )));
    }
    if input[1] != filter[1] * group {
        return Err(fail(format!(
            "input has {} channels, filter expects {}",
            input[1],
            filter[1] * group
        )));
    }
    if filter[2] != p.kernel[0] || filter[3] != p.kernel[1] {
        return Err(fail(format!("filter {filter:?} does not match kernel {:?}", p.kernel)));
    }
    if p.stride.contains(&0) || p.dilation.contains(&0) {
        return Err(fail("stride and dilation must be positive".to_string()));
    }
    let spatial = |size: usize, pad: usize, k: usize, stride: usize, dilation: usize| {
        if k == 0 {
            return None;
        }
        let extent = dilation * (k - 1) + 1;
        let padded = size + pad;
        if padded < extent {
            None
        } else {
            Some((padded - extent) / stride + 1)
        }
    };
    let oh = spatial(input[2], p.pads[0] + p.pads[1], p.kernel[0], p.stride[0], p.dilation[0]);
    let ow = spatial(input[3], p.pads[2] + p.pads[3], p.kernel[1], p.stride[1], p.dilation[1]);
    match (oh, ow) {
        (Some(oh), Some(ow)) => Ok(smallvec![input[0], p.output_channels, oh, ow]),
        _ => Err(fail(format!("kernel {:?} larger than padded input {input:?}", p.kernel))),
    }
}

fn inner_product_shape(
    layer: &LayerInfo,
    p: &InnerProductParam,
    resource: Option<&LayerResource>,
    input: &[usize],
) -> Result<DimsVector> {
    let fail = |msg: String| Status::shape_inference(&layer.name, msg);
    let Some(LayerResource::InnerProduct(r)) = resource else {
        return Err(fail("inner product weight missing".to_string()));
    };
    if p.axis == 0 || p.axis > input.len() {
        return Err(fail(format!("axis {} invalid for rank {}", p.axis, input.len())));
    }
    let k = dims::count_range(input, p.axis, input.len());
    let w = r.weight.dims();
    if w.len() != 2 || w[0] != p.num_output || w[1] != k {
        return Err(fail(format!(
            "weight {w:?} does not match [{}, {k}]",
            p.num_output
        )));
    }
    let mut out = DimsVector::from_slice(&input[..p.axis]);
    out.push(p.num_output);
    Ok(out)
}

/// Batched matrix product dims with broadcast batch axes.
pub fn matmul_shape(a: &[usize], b: &[usize]) -> std::result::Result<DimsVector, String> {
    if a.len() < 2 || b.len() < 2 {
        return Err(format!("matmul operands must be at least rank 2: {a:?} x {b:?}"));
    }
    let (m, k) = (a[a.len() - 2], a[a.len() - 1]);
    let (k2, n) = (b[b.len() - 2], b[b.len() - 1]);
    if k != k2 {
        return Err(format!("contracting dims differ: {a:?} x {b:?}"));
    }
    let mut out = broadcast(&a[..a.len() - 2], &b[..b.len() - 2])
        .ok_or_else(|| format!("batch dims do not broadcast: {a:?} x {b:?}"))?;
    out.push(m);
    out.push(n);
    Ok(out)
}

fn gather_shape(
    layer: &LayerInfo,
    p: &GatherParam,
    resource: Option<&LayerResource>,
    inputs: &[&[usize]],
) -> Result<DimsVector> {
    let fail = |msg: String| Status::shape_inference(&layer.name, msg);
    let res = match resource {
        Some(LayerResource::Gather(r)) => Some(r),
        _ => None,
    };
    let mut blob_inputs = inputs.iter().copied();
    let data: &[usize] = if p.data_in_resource {
        res.and_then(|r| r.data.as_ref())
            .map(|d| d.dims())
            .ok_or_else(|| fail("gather data missing from resource".to_string()))?
    } else {
        blob_inputs
            .next()
            .ok_or_else(|| fail("gather data input missing".to_string()))?
    };
    let indices: &[usize] = if p.indices_in_resource {
        res.and_then(|r| r.indices.as_ref())
            .map(|d| d.dims())
            .ok_or_else(|| fail("gather indices missing from resource".to_string()))?
    } else {
        blob_inputs
            .next()
            .ok_or_else(|| fail("gather indices input missing".to_string()))?
    };
    let axis = normalize_axis(p.axis, data.len())
        .ok_or_else(|| fail(format!("axis {} out of range for rank {}", p.axis, data.len())))?;
    let mut out = DimsVector::from_slice(&data[..axis]);
    out.extend_from_slice(indices);
    out.extend_from_slice(&data[axis + 1..]);
    Ok(out)
}

fn lstm_shapes(
    layer: &LayerInfo,
    hidden: usize,
    resource: Option<&LayerResource>,
    inputs: &[&[usize]],
) -> Result<Vec<DimsVector>> {
    let fail = |msg: String| Status::shape_inference(&layer.name, msg);
    let Some(LayerResource::Lstm(r)) = resource else {
        return Err(fail("lstm weights missing".to_string()));
    };
    let x = inputs
        .first()
        .copied()
        .ok_or_else(|| fail("missing input".to_string()))?;
    if x.len() != 3 {
        return Err(fail(format!("input must be [seq, batch, features], got {x:?}")));
    }
    let (seq, batch, features) = (x[0], x[1], x[2]);
    if r.w.dims() != [4 * hidden, features] {
        return Err(fail(format!(
            "W {:?} does not match [{}, {features}]",
            r.w.dims(),
            4 * hidden
        )));
    }
    if r.r.dims() != [4 * hidden, hidden] {
        return Err(fail(format!("R {:?} does not match [{}, {hidden}]", r.r.dims(), 4 * hidden)));
    }
    if let Some(bias) = &r.bias {
        if bias.count() != 8 * hidden {
            return Err(fail(format!("bias has {} elements, expected {}", bias.count(), 8 * hidden)));
        }
    }
    for state in &inputs[1..] {
        if *state != [batch, hidden] {
            return Err(fail(format!("initial state {state:?} must be [{batch}, {hidden}]")));
        }
    }
    Ok(vec![
        smallvec![seq, batch, hidden],
        smallvec![batch, hidden],
        smallvec![batch, hidden],
    ])
}

/// Resolves `0` (copy) and `-1` (infer) entries of a reshape target.
pub fn reshape_shape(input: &[usize], target: &[i64]) -> std::result::Result<DimsVector, String> {
    let total = dims::count(input);
    let mut out = DimsVector::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &d) in target.iter().enumerate() {
        match d {
            -1 => {
                if infer_at.replace(i).is_some() {
                    return Err(format!("more than one -1 in {target:?}"));
                }
                out.push(1);
            }
            0 => out.push(
                *input
                    .get(i)
                    .ok_or_else(|| format!("0 at position {i} has no input dim to copy"))?,
            ),
            d if d > 0 => out.push(d as usize),
            d => return Err(format!("invalid target dim {d}")),
        }
    }
    let known = dims::count(&out);
    if let Some(i) = infer_at {
        if known == 0 || total % known != 0 {
            return Err(format!("cannot infer -1 reshaping {input:?} to {target:?}"));
        }
        out[i] = total / known;
    }
    if dims::count(&out) != total {
        return Err(format!("cannot reshape {input:?} to {target:?}"));
    }
    Ok(out)
}

/// Resolved element types of every tensor and the promotion rule each
/// layer's kernel applies.
#[derive(Debug, Clone, PartialEq)]
pub struct TypePlan {
    pub tensors: BTreeMap<String, DataType>,
    /// Parallel to `structure.layers`.
    pub rules: Vec<PromotionRule>,
}

impl TypePlan {
    pub fn data_type(&self, name: &str) -> DataType {
        self.tensors.get(name).copied().unwrap_or(DataType::Float32)
    }
}

/// Splices the type of `layer`'s elementwise constant into `types` at the
/// operand position the kernel reads it from.
pub fn with_constant_type(
    layer: &LayerInfo,
    resource: &NetResource,
    mut types: Vec<DataType>,
) -> Vec<DataType> {
    let position = match &layer.param {
        LayerParam::Elementwise(p) => p.constant_operand,
        LayerParam::FusedElementwise(p) => p.head_param.constant_operand,
        _ => None,
    };
    let Some(position) = position else {
        return types;
    };
    if let Some(LayerResource::Elementwise(r)) = resource.get(&layer.name).map(|r| r.as_ref()) {
        types.insert(position.min(types.len()), r.constant.data_type());
    }
    types
}

/// Propagates data types through the kernels registered for `device`.
pub fn infer_data_types(
    structure: &NetStructure,
    resource: &NetResource,
    registry: &Registry,
    device: DeviceType,
) -> Result<TypePlan> {
    let mut tensors: BTreeMap<String, DataType> = structure
        .inputs_shape_map
        .keys()
        .map(|name| (name.clone(), structure.input_data_type(name)))
        .collect();
    let mut rules = Vec::with_capacity(structure.layers.len());
    for layer in &structure.layers {
        let kernel = registry.kernel(layer.layer_type, device)?;
        let mut input_types = Vec::with_capacity(layer.inputs.len());
        for name in &layer.inputs {
            let data_type = tensors.get(name).copied().ok_or_else(|| {
                Status::graph(format!("layer '{}' reads unknown tensor '{name}'", layer.name))
            })?;
            input_types.push(data_type);
        }
        let input_types = with_constant_type(layer, resource, input_types);
        let rule = kernel
            .promotion
            .resolve(&input_types)
            .map_err(|err| Status::new(err.kind(), format!("layer '{}': {}", layer.name, err.message())))?;
        for name in &layer.outputs {
            tensors.insert(name.clone(), rule.output);
        }
        rules.push(*rule);
    }
    Ok(TypePlan { tensors, rules })
}
