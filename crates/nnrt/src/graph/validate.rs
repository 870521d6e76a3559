use std::collections::{HashMap, HashSet};

use super::{LayerInfo, NetResource, NetStructure};
use crate::layer::{LayerParam, LayerType};
use crate::status::{Result, Status};

/// Checks that the structure is a well-formed DAG in topological order.
///
/// Every consumed tensor has exactly one producer earlier in the list or is
/// a declared input, declared outputs exist, and each layer's parameters,
/// arity and resource match its operator kind.
pub fn validate(structure: &NetStructure, resource: &NetResource) -> Result<()> {
    let mut producers: HashMap<&str, usize> = HashMap::new();
    for (idx, layer) in structure.layers.iter().enumerate() {
        for output in &layer.outputs {
            if structure.is_input(output) {
                return Err(Status::graph(format!(
                    "layer '{}' overwrites graph input '{}'",
                    layer.name, output
                )));
            }
            if let Some(prev) = producers.insert(output.as_str(), idx) {
                return Err(Status::graph(format!(
                    "tensor '{}' is produced by both '{}' and '{}'",
                    output, structure.layers[prev].name, layer.name
                )));
            }
        }
    }

    let mut names = HashSet::new();
    let mut available: HashSet<&str> = structure
        .inputs_shape_map
        .keys()
        .map(String::as_str)
        .collect();
    for (idx, layer) in structure.layers.iter().enumerate() {
        if !names.insert(layer.name.as_str()) {
            return Err(Status::graph(format!("duplicate layer name '{}'", layer.name)));
        }
        for input in &layer.inputs {
            if available.contains(input.as_str()) {
                continue;
            }
            return Err(match producers.get(input.as_str()) {
                Some(&p) if p == idx => Status::graph(format!(
                    "layer '{}' consumes its own output '{}'",
                    layer.name, input
                )),
                Some(&p) => Status::graph(format!(
                    "layer '{}' reads '{}' before its producer '{}'",
                    layer.name, input, structure.layers[p].name
                )),
                None => Status::graph(format!(
                    "layer '{}' reads undefined tensor '{}'",
                    layer.name, input
                )),
            });
        }
        check_layer(layer, resource)?;
        available.extend(layer.outputs.iter().map(String::as_str));
    }

    for output in &structure.outputs {
        if !available.contains(output.as_str()) {
            return Err(Status::graph(format!(
                "declared output '{output}' is never produced"
            )));
        }
    }
    for name in &structure.persistent {
        if !available.contains(name.as_str()) {
            return Err(Status::graph(format!(
                "persistent tensor '{name}' is never produced"
            )));
        }
    }
    Ok(())
}

fn check_layer(layer: &LayerInfo, resource: &NetResource) -> Result<()> {
    if layer.param.kind() != layer.layer_type.param_kind() {
        return Err(Status::graph(format!(
            "layer '{}' of kind {} carries {:?} parameters, expected {:?}",
            layer.name,
            layer.layer_type,
            layer.param.kind(),
            layer.layer_type.param_kind()
        )));
    }

    let layer_resource = resource.get(&layer.name);
    if let Some(res) = layer_resource {
        if !res.fits(layer.layer_type) {
            return Err(Status::graph(format!(
                "layer '{}' of kind {} has a {} resource",
                layer.name,
                layer.layer_type,
                res.kind_name()
            )));
        }
    }

    let (inputs, outputs, needs_resource) = arity(layer);
    if !inputs.contains(&layer.inputs.len()) {
        return Err(Status::graph(format!(
            "layer '{}' of kind {} has {} inputs, expected {:?}",
            layer.name,
            layer.layer_type,
            layer.inputs.len(),
            inputs
        )));
    }
    if !outputs.contains(&layer.outputs.len()) {
        return Err(Status::graph(format!(
            "layer '{}' of kind {} has {} outputs, expected {:?}",
            layer.name,
            layer.layer_type,
            layer.outputs.len(),
            outputs
        )));
    }
    if needs_resource && layer_resource.is_none() {
        return Err(Status::graph(format!(
            "layer '{}' of kind {} has no resource",
            layer.name, layer.layer_type
        )));
    }
    Ok(())
}

/// Accepted input count, output count and whether a resource is required.
fn arity(layer: &LayerInfo) -> (std::ops::RangeInclusive<usize>, std::ops::RangeInclusive<usize>, bool) {
    let any = 1..=usize::MAX;
    match (&layer.layer_type, &layer.param) {
        (t, LayerParam::Elementwise(p)) if t.is_binary_elementwise() => match p.constant_operand {
            Some(_) => (1..=1, 1..=1, true),
            None => (2..=2, 1..=1, false),
        },
        (t, _) if t.is_unary_activation() => (1..=1, 1..=1, false),
        (LayerType::Convolution, _) | (LayerType::InnerProduct, _) => (1..=1, 1..=1, true),
        (LayerType::MatMul, LayerParam::MatMul(p)) => match p.weight_position {
            Some(_) => (1..=1, 1..=1, true),
            None => (2..=2, 1..=1, false),
        },
        (LayerType::Gather, LayerParam::Gather(p)) => {
            let from_resource = usize::from(p.data_in_resource) + usize::from(p.indices_in_resource);
            let n = 2 - from_resource;
            (n..=n, 1..=1, from_resource > 0)
        }
        (LayerType::Lstm, _) => (1..=3, 1..=3, true),
        (LayerType::Concat, _) => (any, 1..=1, false),
        (LayerType::FusedElementwise, LayerParam::FusedElementwise(p)) => {
            match p.head_param.constant_operand {
                Some(_) => (1..=1, 1..=1, true),
                None if p.head.is_binary_elementwise() => (2..=2, 1..=1, false),
                None => (1..=1, 1..=1, false),
            }
        }
        _ => (1..=1, 1..=1, false),
    }
}
