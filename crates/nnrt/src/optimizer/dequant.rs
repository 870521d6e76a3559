//! Dynamic-range dequantization.
//!
//! Folds `weight_fp = (weight_int - zero_point) * scale` into float weights
//! for convolution, inner product, matrix multiply, LSTM and embedding
//! gather. Other quantized resources are left as they are and reported.

use std::sync::Arc;

use super::{NetOptimizer, OptimizeContext, PassResult};
use crate::blob::dims;
use crate::graph::Graph;
use crate::layer::resource::{
    ConvResource, GatherResource, InnerProductResource, LstmResource, MatMulResource,
};
use crate::layer::{LayerResource, QuantParams, RawBuffer};
use crate::status::{Result, Status};

#[derive(Debug, Default)]
pub struct DynamicRangeDequantPass;

impl DynamicRangeDequantPass {
    pub const NAME: &'static str = "dynamic_range_dequant";
}

impl NetOptimizer for DynamicRangeDequantPass {
    fn strategy(&self) -> &'static str {
        Self::NAME
    }

    fn is_supported(&self, cx: &OptimizeContext<'_>) -> bool {
        cx.capabilities()
            .map_or(true, |caps| !caps.native_int8_weights)
    }

    fn optimize(&self, graph: &mut Graph, _cx: &OptimizeContext<'_>) -> Result<PassResult> {
        let mut result = PassResult::default();
        let mut replacements: Vec<(String, LayerResource)> = Vec::new();

        for layer in &graph.structure.layers {
            let Some(resource) = graph.resource.get(&layer.name) else {
                continue;
            };
            if !resource.is_quantized() {
                continue;
            }
            match dequantize_resource(resource).map_err(|err| {
                Status::optimizer(Self::NAME, format!("layer '{}': {}", layer.name, err.message()))
            })? {
                Some(rewritten) => replacements.push((layer.name.clone(), rewritten)),
                None => {
                    tracing::warn!(
                        layer = %layer.name,
                        kind = %layer.layer_type,
                        "quantized resource left untouched: operator has no dequantization rule"
                    );
                    result.flagged.push(layer.name.clone());
                }
            }
        }

        for (name, rewritten) in replacements {
            graph
                .resource
                .resource_map
                .insert(name, Arc::new(rewritten));
            result.rewrites_applied += 1;
        }
        result.changed = result.rewrites_applied > 0;
        Ok(result)
    }
}

/// `Ok(None)` means the resource kind has no dequantization rule.
fn dequantize_resource(resource: &LayerResource) -> Result<Option<LayerResource>> {
    let rewritten = match resource {
        LayerResource::Convolution(r) => LayerResource::Convolution(ConvResource {
            filter: dequantize(&r.filter, r.quant.as_ref())?,
            bias: float_bias(r.bias.as_ref())?,
            quant: None,
        }),
        LayerResource::InnerProduct(r) => LayerResource::InnerProduct(InnerProductResource {
            weight: dequantize(&r.weight, r.quant.as_ref())?,
            bias: float_bias(r.bias.as_ref())?,
            quant: None,
        }),
        LayerResource::MatMul(r) => LayerResource::MatMul(MatMulResource {
            weight: dequantize(&r.weight, r.quant.as_ref())?,
            quant: None,
        }),
        LayerResource::Gather(r) => {
            let data = match &r.data {
                Some(data) => Some(dequantize(data, r.quant.as_ref())?),
                None => return Ok(None),
            };
            LayerResource::Gather(GatherResource {
                data,
                indices: r.indices.clone(),
                quant: None,
            })
        }
        LayerResource::Lstm(r) => LayerResource::Lstm(LstmResource {
            w: dequantize_if_needed(&r.w, r.w_quant.as_ref())?,
            r: dequantize_if_needed(&r.r, r.r_quant.as_ref())?,
            bias: float_bias(r.bias.as_ref())?,
            w_quant: None,
            r_quant: None,
        }),
        LayerResource::Elementwise(_) => return Ok(None),
    };
    Ok(Some(rewritten))
}

fn dequantize_if_needed(weight: &RawBuffer, quant: Option<&QuantParams>) -> Result<RawBuffer> {
    if quant.is_none() && !weight.is_quantized_storage() {
        return Ok(weight.clone());
    }
    dequantize(weight, quant)
}

fn float_bias(bias: Option<&RawBuffer>) -> Result<Option<RawBuffer>> {
    match bias {
        None => Ok(None),
        Some(b) => Ok(Some(RawBuffer::from_f32(b.dims(), b.to_f32_vec()?)?)),
    }
}

/// Expands int8/uint8 `weight` to float32 with `quant`.
///
/// One scale applies to the whole tensor; otherwise scales index the slices
/// along `quant.axis`. A single zero point is shared; several must match
/// the scale count. A missing zero point is zero.
pub fn dequantize(weight: &RawBuffer, quant: Option<&QuantParams>) -> Result<RawBuffer> {
    let Some(quant) = quant else {
        return Err(Status::param("integer weights carry no scale"));
    };
    if !weight.is_quantized_storage() {
        return Err(Status::param(format!(
            "scale attached to {} weights",
            weight.data_type()
        )));
    }
    let values = weight.to_i64_vec()?;
    let scales = quant.scale.to_f32_vec()?;
    let zero_points = match &quant.zero_point {
        Some(zp) => zp.to_i64_vec()?,
        None => vec![0],
    };

    let shape = weight.dims();
    let (channels, inner) = if scales.len() == 1 {
        (1, values.len().max(1))
    } else {
        if quant.axis >= shape.len() || shape[quant.axis] != scales.len() {
            return Err(Status::param(format!(
                "{} scales do not match axis {} of weight dims {:?}",
                scales.len(),
                quant.axis,
                shape
            )));
        }
        (scales.len(), dims::count_range(shape, quant.axis + 1, shape.len()))
    };
    if zero_points.len() != 1 && zero_points.len() != scales.len() {
        return Err(Status::param(format!(
            "{} zero points for {} scales",
            zero_points.len(),
            scales.len()
        )));
    }

    let out: Vec<f32> = values
        .iter()
        .enumerate()
        .map(|(i, &q)| {
            let c = (i / inner) % channels;
            let zp = if zero_points.len() == 1 {
                zero_points[0]
            } else {
                zero_points[c]
            };
            (q - zp) as f32 * scales[c]
        })
        .collect();
    RawBuffer::from_f32(shape, out)
}
