//! Inserts explicit layout conversions where a kernel's layout differs from
//! the layout its input was produced in.
//!
//! Conversions are shared: a tensor is converted to a given layout at most
//! once, and a conversion whose input is itself a conversion reads from the
//! original tensor instead. Declared graph outputs stay in `Nchw`; when
//! their producer writes another layout the producer output is renamed and
//! a conversion restores the declared name.

use std::collections::HashMap;

use super::{NetOptimizer, OptimizeContext, PassResult};
use crate::blob::DataFormat;
use crate::graph::{Graph, LayerInfo};
use crate::layer::param::LayoutConvertParam;
use crate::layer::{LayerParam, LayerType};
use crate::status::Result;

#[derive(Debug, Default)]
pub struct LayoutInsertionPass;

impl LayoutInsertionPass {
    pub const NAME: &'static str = "layout_insertion";
}

/// Name of the tensor holding `source` converted to `format`.
pub fn converted_name(source: &str, format: DataFormat) -> String {
    format!("{source}@{format}")
}

impl NetOptimizer for LayoutInsertionPass {
    fn strategy(&self) -> &'static str {
        Self::NAME
    }

    fn is_supported(&self, cx: &OptimizeContext<'_>) -> bool {
        let device = cx.device_type();
        cx.registry.has_kernel(LayerType::LayoutConvert, device)
            && cx
                .registry
                .kernels_for(device)
                .any(|k| k.data_format != DataFormat::Nchw)
    }

    fn optimize(&self, graph: &mut Graph, cx: &OptimizeContext<'_>) -> Result<PassResult> {
        let device = cx.device_type();
        let structure = &graph.structure;

        let mut tracker = FormatTracker::default();
        for name in structure.inputs_shape_map.keys() {
            tracker.formats.insert(name.clone(), DataFormat::Nchw);
        }

        let mut result = PassResult::default();
        let mut layers: Vec<LayerInfo> = Vec::with_capacity(structure.layers.len());

        for layer in &structure.layers {
            if let LayerParam::LayoutConvert(param) = &layer.param {
                tracker.record_conversion(&layer.inputs[0], &layer.outputs[0], param.dst_format);
                layers.push(layer.clone());
                continue;
            }

            let target = match cx.registry.kernel(layer.layer_type, device) {
                Ok(kernel) => kernel.data_format,
                // Left for the engine to report as UnsupportedOperator.
                Err(_) => DataFormat::Nchw,
            };

            let mut rewritten = layer.clone();
            for input in rewritten.inputs.iter_mut() {
                if tracker.format_of(input) == target {
                    continue;
                }
                let (source, source_format) = tracker.root(input);
                if source_format == target {
                    *input = source;
                    continue;
                }
                if let Some(existing) = tracker.conversions.get(&(source.clone(), target)) {
                    *input = existing.clone();
                    continue;
                }
                let converted = converted_name(&source, target);
                layers.push(convert_layer(&source, &converted, source_format, target));
                tracker.record_conversion(&source, &converted, target);
                result.inserted += 1;
                *input = converted;
            }

            let mut restores = Vec::new();
            for output in rewritten.outputs.iter_mut() {
                if target != DataFormat::Nchw && structure.is_output(output) {
                    let declared = output.clone();
                    let renamed = converted_name(&declared, target);
                    *output = renamed.clone();
                    restores.push((renamed, declared));
                }
                tracker.formats.insert(output.clone(), target);
            }
            if rewritten != *layer {
                result.rewrites_applied += 1;
            }
            layers.push(rewritten);

            for (renamed, declared) in restores {
                layers.push(convert_layer(&renamed, &declared, target, DataFormat::Nchw));
                tracker.record_conversion(&renamed, &declared, DataFormat::Nchw);
                result.inserted += 1;
            }
        }

        result.changed = result.inserted > 0 || result.rewrites_applied > 0;
        if result.changed {
            tracing::debug!(
                inserted = result.inserted,
                rewired = result.rewrites_applied,
                device = %device,
                "inserted layout conversions"
            );
            graph.structure.layers = layers;
        }
        Ok(result)
    }
}

#[derive(Default)]
struct FormatTracker {
    formats: HashMap<String, DataFormat>,
    /// Conversion output -> conversion input.
    origin: HashMap<String, String>,
    /// (root tensor, format) -> tensor holding it.
    conversions: HashMap<(String, DataFormat), String>,
}

impl FormatTracker {
    fn format_of(&self, name: &str) -> DataFormat {
        self.formats.get(name).copied().unwrap_or(DataFormat::Nchw)
    }

    /// Follows conversions back to the tensor a kernel actually produced.
    fn root(&self, name: &str) -> (String, DataFormat) {
        let mut current = name;
        while let Some(prev) = self.origin.get(current) {
            current = prev;
        }
        (current.to_string(), self.format_of(current))
    }

    fn record_conversion(&mut self, input: &str, output: &str, format: DataFormat) {
        let (root, _) = self.root(input);
        self.origin.insert(output.to_string(), input.to_string());
        self.formats.insert(output.to_string(), format);
        self.conversions
            .entry((root, format))
            .or_insert_with(|| output.to_string());
    }
}

fn convert_layer(input: &str, output: &str, src: DataFormat, dst: DataFormat) -> LayerInfo {
    LayerInfo {
        layer_type: LayerType::LayoutConvert,
        name: format!("layout_convert/{output}"),
        inputs: vec![input.to_string()],
        outputs: vec![output.to_string()],
        param: LayerParam::LayoutConvert(LayoutConvertParam {
            src_format: src,
            dst_format: dst,
        }),
    }
}
