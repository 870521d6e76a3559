use std::sync::Arc;

use super::{
    DynamicRangeDequantPass, ElementwiseFusionPass, LayoutInsertionPass, NetOptimizer,
    OptimizeContext, PassResult,
};
use crate::graph::Graph;
use crate::status::{Result, Status};

/// Ordered list of passes.
///
/// The default order is dequantization, then fusion, then layout insertion:
/// fusion must see float weights, and layout conversions are placed around
/// the fused kernels rather than between the layers they replace.
pub struct OptimizerPipeline {
    passes: Vec<Arc<dyn NetOptimizer>>,
}

impl OptimizerPipeline {
    pub fn new(passes: Vec<Arc<dyn NetOptimizer>>) -> Self {
        OptimizerPipeline { passes }
    }

    pub fn default_order() -> Self {
        OptimizerPipeline::new(vec![
            Arc::new(DynamicRangeDequantPass),
            Arc::new(ElementwiseFusionPass),
            Arc::new(LayoutInsertionPass),
        ])
    }

    pub fn strategies(&self) -> Vec<&'static str> {
        self.passes.iter().map(|pass| pass.strategy()).collect()
    }

    /// Runs every enabled, supported pass on a copy of `graph`.
    pub fn run(&self, graph: &Graph, cx: &OptimizeContext<'_>) -> Result<Graph> {
        let log_stats = crate::env::pass_stats_enabled();
        let mut current = graph.clone();
        let mut total = PassResult::default();

        for pass in &self.passes {
            let name = pass.strategy();
            if cx.config.disabled_optimizers.iter().any(|d| d == name) {
                tracing::debug!(pass = name, "optimizer pass disabled by config");
                continue;
            }
            if !pass.is_supported(cx) {
                tracing::debug!(pass = name, device = %cx.device_type(), "optimizer pass not supported on device");
                continue;
            }
            let stats = pass.optimize(&mut current, cx)?;
            current
                .validate()
                .map_err(|err| Status::optimizer(name, format!("produced an invalid graph: {err}")))?;
            if log_stats {
                tracing::info!(
                    pass = name,
                    changed = stats.changed,
                    rewrites = stats.rewrites_applied,
                    inserted = stats.inserted,
                    erased = stats.erased,
                    flagged = stats.flagged.len(),
                    layers = current.structure.layers.len(),
                    "optimizer pass stats"
                );
            }
            total = total.merge(stats);
        }

        tracing::debug!(
            changed = total.changed,
            layers = current.structure.layers.len(),
            "optimizer pipeline finished"
        );
        Ok(current)
    }
}

impl Default for OptimizerPipeline {
    fn default() -> Self {
        Self::default_order()
    }
}
