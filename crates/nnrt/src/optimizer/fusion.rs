//! Merges elementwise chains into one `FusedElementwise` layer.
//!
//! A chain starts at an elementwise layer (or an already fused one) and
//! absorbs following unary activations while the running tensor has
//! exactly one consumer and is neither a declared output nor persistent.
//! Every member must compute in float32 and the device's fused kernel must
//! accept the head's inputs and produce the chain's final data type.

use std::collections::{HashMap, HashSet};

use super::{NetOptimizer, OptimizeContext, PassResult};
use crate::blob::DataType;
use crate::graph::{Graph, LayerInfo, NetStructure};
use crate::layer::param::{ElementwiseParam, FusedElementwiseParam};
use crate::layer::{LayerParam, LayerType};
use crate::network::{infer_data_types, with_constant_type, TypePlan};
use crate::status::Result;

#[derive(Debug, Default)]
pub struct ElementwiseFusionPass;

impl ElementwiseFusionPass {
    pub const NAME: &'static str = "elementwise_fusion";
}

impl NetOptimizer for ElementwiseFusionPass {
    fn strategy(&self) -> &'static str {
        Self::NAME
    }

    fn is_supported(&self, cx: &OptimizeContext<'_>) -> bool {
        cx.registry
            .has_kernel(LayerType::FusedElementwise, cx.device_type())
    }

    fn optimize(&self, graph: &mut Graph, cx: &OptimizeContext<'_>) -> Result<PassResult> {
        let device = cx.device_type();
        let fused_kernel = cx.registry.kernel(LayerType::FusedElementwise, device)?;
        let types = match infer_data_types(&graph.structure, &graph.resource, cx.registry, device)
        {
            Ok(types) => types,
            Err(err) => {
                tracing::debug!(error = %err, "fusion skipped: data types unresolved");
                return Ok(PassResult::default());
            }
        };

        let structure = &graph.structure;
        let counts: HashMap<String, usize> = structure
            .consumer_counts()
            .into_iter()
            .map(|(name, n)| (name.to_string(), n))
            .collect();

        let mut absorbed: HashSet<usize> = HashSet::new();
        let mut chains: HashMap<usize, Vec<usize>> = HashMap::new();
        for (idx, head) in structure.layers.iter().enumerate() {
            if absorbed.contains(&idx) || !is_chain_head(head) {
                continue;
            }
            if types.rules[idx].compute != DataType::Float32 {
                continue;
            }
            let chain = collect_chain(structure, &types, &counts, idx);
            if chain.len() < 2 {
                continue;
            }
            let Some(&last) = chain.last() else {
                continue;
            };
            let head_inputs: Vec<DataType> = head
                .inputs
                .iter()
                .map(|name| types.data_type(name))
                .collect();
            let head_inputs = with_constant_type(head, &graph.resource, head_inputs);
            let final_type = types.data_type(&structure.layers[last].outputs[0]);
            match fused_kernel.promotion.resolve(&head_inputs) {
                Ok(rule) if rule.compute == DataType::Float32 && rule.output == final_type => {}
                _ => continue,
            }
            absorbed.extend(chain.iter().copied());
            chains.insert(idx, chain);
        }

        if chains.is_empty() {
            return Ok(PassResult::default());
        }

        let mut result = PassResult {
            changed: true,
            ..PassResult::default()
        };
        let mut layers = Vec::with_capacity(structure.layers.len());
        for (idx, layer) in structure.layers.iter().enumerate() {
            if let Some(chain) = chains.get(&idx) {
                layers.push(fuse(structure, chain));
                result.rewrites_applied += 1;
                result.erased += chain.len() - 1;
            } else if !absorbed.contains(&idx) {
                layers.push(layer.clone());
            }
        }
        tracing::debug!(
            chains = result.rewrites_applied,
            erased = result.erased,
            "fused elementwise chains"
        );
        graph.structure.layers = layers;
        Ok(result)
    }
}

fn is_chain_head(layer: &LayerInfo) -> bool {
    layer.layer_type.is_elementwise() || layer.layer_type == LayerType::FusedElementwise
}

fn collect_chain(
    structure: &NetStructure,
    types: &TypePlan,
    counts: &HashMap<String, usize>,
    head: usize,
) -> Vec<usize> {
    let mut chain = vec![head];
    let mut current = structure.layers[head].outputs[0].as_str();
    loop {
        if structure.is_output(current) || structure.persistent.contains(current) {
            break;
        }
        if counts.get(current).copied() != Some(1) {
            break;
        }
        let consumers = structure.consumers_of(current);
        let Some(&next_idx) = consumers.first() else {
            break;
        };
        let next = &structure.layers[next_idx];
        if !next.layer_type.is_unary_activation() || next.inputs.len() != 1 {
            break;
        }
        if types.rules[next_idx].compute != DataType::Float32 {
            break;
        }
        chain.push(next_idx);
        current = next.outputs[0].as_str();
    }
    chain
}

fn fuse(structure: &NetStructure, chain: &[usize]) -> LayerInfo {
    let head = &structure.layers[chain[0]];
    let mut param = match &head.param {
        LayerParam::FusedElementwise(p) => p.clone(),
        LayerParam::Elementwise(p) => FusedElementwiseParam {
            head: head.layer_type,
            head_param: *p,
            tail: Vec::new(),
            fused_layers: vec![head.name.clone()],
        },
        _ => FusedElementwiseParam {
            head: head.layer_type,
            head_param: ElementwiseParam::default(),
            tail: Vec::new(),
            fused_layers: vec![head.name.clone()],
        },
    };
    let mut outputs = head.outputs.clone();
    for &idx in &chain[1..] {
        let member = &structure.layers[idx];
        param.tail.push(member.layer_type);
        param.fused_layers.push(member.name.clone());
        outputs = member.outputs.clone();
    }
    LayerInfo {
        layer_type: LayerType::FusedElementwise,
        name: head.name.clone(),
        inputs: head.inputs.clone(),
        outputs,
        param: LayerParam::FusedElementwise(param),
    }
}
