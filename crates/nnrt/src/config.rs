//! Engine configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::blob::{DataType, DimsVector};
use crate::device::DeviceType;
use crate::status::{Result, Status};

/// How the engine backs intermediate tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMemoryPolicy {
    /// Tensors with disjoint live ranges share allocations.
    #[default]
    Reuse,
    /// Every intermediate gets its own allocation.
    NoReuse,
    /// The caller supplies forward memory through `set_forward_memory`.
    SetFromExternal,
}

/// Device selection and execution policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub device_type: DeviceType,
    pub device_id: u32,
    pub forward_memory_policy: ForwardMemoryPolicy,
    /// Optimizer passes to skip, by strategy name.
    pub disabled_optimizers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            device_type: DeviceType::Naive,
            device_id: 0,
            forward_memory_policy: ForwardMemoryPolicy::Reuse,
            disabled_optimizers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn for_device(device_type: DeviceType) -> Self {
        NetworkConfig {
            device_type,
            ..Self::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Status::param(format!("invalid network config: {err}")))
    }

    /// Policy after environment overrides.
    pub fn effective_memory_policy(&self) -> ForwardMemoryPolicy {
        if self.forward_memory_policy == ForwardMemoryPolicy::Reuse
            && crate::env::memory_reuse_disabled()
        {
            ForwardMemoryPolicy::NoReuse
        } else {
            self.forward_memory_policy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationMode {
    #[default]
    None,
    /// Int8 weights with float scales, dequantized ahead of execution.
    DynamicRange,
}

/// Model-level metadata that accompanies a parsed graph.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Overrides the shapes declared in the structure.
    pub input_shapes: BTreeMap<String, DimsVector>,
    pub input_data_types: BTreeMap<String, DataType>,
    pub quantization: QuantizationMode,
}

impl ModelConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| Status::param(format!("invalid model config: {err}")))
    }
}
