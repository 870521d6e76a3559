//! In-memory model: ordered layers, tensor bindings and learned constants.

mod validate;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

pub use validate::validate;

use crate::blob::{DataType, DimsVector};
use crate::layer::{LayerParam, LayerResource, LayerType};

/// Static definition of one graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInfo {
    pub layer_type: LayerType,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub param: LayerParam,
}

impl LayerInfo {
    pub fn new(
        layer_type: LayerType,
        name: impl Into<String>,
        inputs: &[&str],
        outputs: &[&str],
        param: LayerParam,
    ) -> Self {
        LayerInfo {
            layer_type,
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            param,
        }
    }
}

/// Ordered layer list plus declared graph inputs and outputs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetStructure {
    pub inputs_shape_map: BTreeMap<String, DimsVector>,
    /// Missing entries default to `Float32`.
    pub input_data_type_map: BTreeMap<String, DataType>,
    pub outputs: Vec<String>,
    pub layers: Vec<LayerInfo>,
    /// Intermediates that must keep a dedicated allocation.
    pub persistent: BTreeSet<String>,
}

impl NetStructure {
    pub fn add_input(&mut self, name: &str, dims: &[usize], data_type: DataType) -> &mut Self {
        self.inputs_shape_map
            .insert(name.to_string(), DimsVector::from_slice(dims));
        self.input_data_type_map.insert(name.to_string(), data_type);
        self
    }

    pub fn add_output(&mut self, name: &str) -> &mut Self {
        self.outputs.push(name.to_string());
        self
    }

    pub fn push_layer(&mut self, layer: LayerInfo) -> &mut Self {
        self.layers.push(layer);
        self
    }

    pub fn is_input(&self, name: &str) -> bool {
        self.inputs_shape_map.contains_key(name)
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    pub fn input_data_type(&self, name: &str) -> DataType {
        self.input_data_type_map
            .get(name)
            .copied()
            .unwrap_or(DataType::Float32)
    }

    /// Every tensor name the graph mentions.
    pub fn blobs(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.inputs_shape_map.keys().cloned().collect();
        for layer in &self.layers {
            names.extend(layer.inputs.iter().cloned());
            names.extend(layer.outputs.iter().cloned());
        }
        names
    }

    pub fn producer_of(&self, name: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|layer| layer.outputs.iter().any(|o| o == name))
    }

    pub fn consumers_of(&self, name: &str) -> Vec<usize> {
        self.layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.inputs.iter().any(|i| i == name))
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Number of consuming layers per tensor name.
    pub fn consumer_counts(&self) -> HashMap<&str, usize> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for layer in &self.layers {
            let mut seen: BTreeSet<&str> = BTreeSet::new();
            for input in &layer.inputs {
                if seen.insert(input.as_str()) {
                    *counts.entry(input.as_str()).or_default() += 1;
                }
            }
        }
        counts
    }

    pub fn layer(&self, name: &str) -> Option<&LayerInfo> {
        self.layers.iter().find(|layer| layer.name == name)
    }
}

/// Learned constants keyed by layer name. Entries are shared, never copied,
/// between the caller's resource and optimized graphs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetResource {
    pub resource_map: BTreeMap<String, Arc<LayerResource>>,
}

impl NetResource {
    pub fn get(&self, layer: &str) -> Option<&Arc<LayerResource>> {
        self.resource_map.get(layer)
    }

    pub fn insert(&mut self, layer: &str, resource: LayerResource) -> &mut Self {
        self.resource_map
            .insert(layer.to_string(), Arc::new(resource));
        self
    }
}

/// An interpreted model ready for the optimizer and the engine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Graph {
    pub structure: NetStructure,
    pub resource: NetResource,
}

impl Graph {
    pub fn new(structure: NetStructure, resource: NetResource) -> Self {
        Graph {
            structure,
            resource,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        validate(&self.structure, &self.resource)
    }
}
