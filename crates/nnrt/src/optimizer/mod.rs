//! Device-aware graph rewrites run before an engine binds kernels.
//!
//! Each pass is idempotent: running it on its own output changes nothing.
//! [`OptimizerPipeline`] applies the passes in a fixed order and skips the
//! ones a device does not support.

mod dequant;
mod fusion;
mod layout;
mod pipeline;

use std::sync::Arc;

pub use dequant::{dequantize, DynamicRangeDequantPass};
pub use fusion::ElementwiseFusionPass;
pub use layout::LayoutInsertionPass;
pub use pipeline::OptimizerPipeline;

use crate::config::{ModelConfig, NetworkConfig};
use crate::device::{Device, DeviceCapabilities, DeviceType};
use crate::graph::Graph;
use crate::registry::Registry;
use crate::status::Result;

/// Read-only view of what the passes need to know about the target.
pub struct OptimizeContext<'a> {
    pub registry: &'a Registry,
    pub config: &'a NetworkConfig,
    pub model: &'a ModelConfig,
    device: Option<Arc<dyn Device>>,
}

impl<'a> OptimizeContext<'a> {
    pub fn new(registry: &'a Registry, config: &'a NetworkConfig, model: &'a ModelConfig) -> Self {
        let device = registry.device(config.device_type).ok();
        OptimizeContext {
            registry,
            config,
            model,
            device,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.config.device_type
    }

    /// `None` when the device is not registered.
    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.device.as_deref().map(|device| device.capabilities())
    }
}

/// Statistics reported by one pass run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassResult {
    pub changed: bool,
    /// Layers or resources rewritten in place.
    pub rewrites_applied: usize,
    /// Layers added to the structure.
    pub inserted: usize,
    /// Layers removed from the structure.
    pub erased: usize,
    /// Layers the pass could not handle and left untouched.
    pub flagged: Vec<String>,
}

impl PassResult {
    pub fn merge(mut self, other: PassResult) -> PassResult {
        self.changed |= other.changed;
        self.rewrites_applied += other.rewrites_applied;
        self.inserted += other.inserted;
        self.erased += other.erased;
        self.flagged.extend(other.flagged);
        self
    }
}

pub trait NetOptimizer: Send + Sync {
    /// Stable pass name, also used by `NetworkConfig::disabled_optimizers`.
    fn strategy(&self) -> &'static str;

    fn is_supported(&self, cx: &OptimizeContext<'_>) -> bool;

    /// Rewrites `graph` in place. On error the graph must be discarded.
    fn optimize(&self, graph: &mut Graph, cx: &OptimizeContext<'_>) -> Result<PassResult>;

    /// Pure form of [`NetOptimizer::optimize`].
    fn apply(&self, graph: &Graph, cx: &OptimizeContext<'_>) -> Result<Graph> {
        let mut out = graph.clone();
        self.optimize(&mut out, cx)?;
        Ok(out)
    }
}
