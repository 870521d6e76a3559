//! Table-driven type promotion.
//!
//! Every kernel registers a [`PromotionTable`] listing the input type
//! combinations it accepts, the type it computes in and the type it
//! produces. Resolution is exact: a combination missing from the table is
//! `UnsupportedTypeCombination`. Conversions between element types go
//! through [`CONVERSIONS`]; a table that needs a conversion absent from it
//! is rejected when the kernel registers. Narrowing integer conversions
//! are not in the list.

use half::{bf16, f16};

use crate::blob::DataType;
use crate::status::{ErrorKind, Result, Status};

use DataType::*;

/// Input types a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSignature {
    /// One entry per blob input, in order.
    Exact(&'static [DataType]),
    /// Any number of inputs, all of this type.
    Uniform(DataType),
}

impl TypeSignature {
    pub fn matches(&self, inputs: &[DataType]) -> bool {
        match self {
            TypeSignature::Exact(expected) => *expected == inputs,
            TypeSignature::Uniform(t) => !inputs.is_empty() && inputs.iter().all(|x| x == t),
        }
    }

    fn types(&self) -> &[DataType] {
        match self {
            TypeSignature::Exact(types) => types,
            TypeSignature::Uniform(t) => std::slice::from_ref(t),
        }
    }

    fn overlaps(&self, other: &TypeSignature) -> bool {
        match (self, other) {
            (TypeSignature::Exact(a), TypeSignature::Exact(b)) => a == b,
            (TypeSignature::Uniform(a), TypeSignature::Uniform(b)) => a == b,
            (TypeSignature::Uniform(t), TypeSignature::Exact(e))
            | (TypeSignature::Exact(e), TypeSignature::Uniform(t)) => {
                !e.is_empty() && e.iter().all(|x| x == t)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionRule {
    pub inputs: TypeSignature,
    pub compute: DataType,
    pub output: DataType,
    /// Input positions read as indices rather than converted to `compute`.
    pub index_operands: &'static [usize],
}

impl PromotionRule {
    pub const fn exact(inputs: &'static [DataType], compute: DataType, output: DataType) -> Self {
        PromotionRule {
            inputs: TypeSignature::Exact(inputs),
            compute,
            output,
            index_operands: &[],
        }
    }

    pub const fn uniform(input: DataType, compute: DataType, output: DataType) -> Self {
        PromotionRule {
            inputs: TypeSignature::Uniform(input),
            compute,
            output,
            index_operands: &[],
        }
    }

    /// Marks `positions` as index operands. They must be integers and are
    /// exempt from the conversion check.
    pub const fn with_indices(self, positions: &'static [usize]) -> Self {
        PromotionRule {
            index_operands: positions,
            ..self
        }
    }

    pub fn is_index_operand(&self, position: usize) -> bool {
        self.index_operands.contains(&position)
    }
}

/// Accepted input combinations of one kernel.
#[derive(Debug)]
pub struct PromotionTable {
    pub name: &'static str,
    pub rules: &'static [PromotionRule],
}

impl PromotionTable {
    pub fn resolve(&self, inputs: &[DataType]) -> Result<&PromotionRule> {
        self.rules
            .iter()
            .find(|rule| rule.inputs.matches(inputs))
            .ok_or_else(|| {
                let names: Vec<&str> = inputs.iter().map(|t| t.name()).collect();
                Status::new(
                    ErrorKind::UnsupportedTypeCombination,
                    format!("{}: no promotion rule for ({})", self.name, names.join(", ")),
                )
            })
    }

    /// Rejects tables with ambiguous rules or conversions that do not exist.
    pub fn validate(&self) -> Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            for other in &self.rules[i + 1..] {
                if rule.inputs.overlaps(&other.inputs) {
                    return Err(Status::new(
                        ErrorKind::UnsupportedTypeCombination,
                        format!("{}: rules {:?} and {:?} overlap", self.name, rule, other),
                    ));
                }
            }
            for (position, &input) in rule.inputs.types().iter().enumerate() {
                if rule.is_index_operand(position) {
                    if !matches!(input, Int32 | Int64) {
                        return Err(Status::new(
                            ErrorKind::UnsupportedTypeCombination,
                            format!("{}: index operand {position} is {input}", self.name),
                        ));
                    }
                    continue;
                }
                if !can_convert(input, rule.compute) {
                    return Err(missing_conversion(self.name, input, rule.compute));
                }
            }
            if !can_convert(rule.compute, rule.output) {
                return Err(missing_conversion(self.name, rule.compute, rule.output));
            }
        }
        Ok(())
    }
}

fn missing_conversion(table: &str, from: DataType, to: DataType) -> Status {
    Status::new(
        ErrorKind::UnsupportedTypeCombination,
        format!("{table}: no conversion from {from} to {to}"),
    )
}

/// Every supported element conversion besides the identity.
pub const CONVERSIONS: &[(DataType, DataType)] = &[
    (Float16, Float32),
    (BFloat16, Float32),
    (Float32, Float16),
    (Float32, BFloat16),
    (Int32, Float32),
    (Int8, Float32),
    (UInt8, Float32),
    (Int8, Int32),
    (UInt8, Int32),
];

pub fn can_convert(from: DataType, to: DataType) -> bool {
    from == to || CONVERSIONS.contains(&(from, to))
}

fn ensure(from: DataType, to: DataType) -> Result<()> {
    if can_convert(from, to) {
        Ok(())
    } else {
        Err(Status::new(
            ErrorKind::UnsupportedTypeCombination,
            format!("no conversion from {from} to {to}"),
        ))
    }
}

fn element_count(bytes: &[u8], data_type: DataType) -> usize {
    bytes.len() / data_type.size_in_bytes()
}

/// Reads `bytes` of `data_type` widened to `f32`.
pub fn read_as_f32(bytes: &[u8], data_type: DataType) -> Result<Vec<f32>> {
    ensure(data_type, Float32)?;
    let n = element_count(bytes, data_type);
    let out = match data_type {
        Float32 => bytemuck::pod_collect_to_vec::<u8, f32>(&bytes[..n * 4]),
        Float16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_ne_bytes([c[0], c[1]]).to_f32())
            .collect(),
        BFloat16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_ne_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Int32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        Int8 => bytes.iter().map(|&b| b as i8 as f32).collect(),
        UInt8 => bytes.iter().map(|&b| b as f32).collect(),
        other => return Err(missing_conversion("read_as_f32", other, Float32)),
    };
    Ok(out)
}

/// Reads `bytes` of `data_type` widened to `i32`.
pub fn read_as_i32(bytes: &[u8], data_type: DataType) -> Result<Vec<i32>> {
    ensure(data_type, Int32)?;
    let out = match data_type {
        Int32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Int8 => bytes.iter().map(|&b| b as i8 as i32).collect(),
        UInt8 => bytes.iter().map(|&b| b as i32).collect(),
        other => return Err(missing_conversion("read_as_i32", other, Int32)),
    };
    Ok(out)
}

/// Stores `values` into `out` as `data_type`. `f32 -> f16/bf16` rounds to
/// nearest.
pub fn write_from_f32(values: &[f32], data_type: DataType, out: &mut [u8]) -> Result<()> {
    ensure(Float32, data_type)?;
    match data_type {
        Float32 => {
            for (dst, v) in out.chunks_exact_mut(4).zip(values) {
                dst.copy_from_slice(&v.to_ne_bytes());
            }
        }
        Float16 => {
            for (dst, v) in out.chunks_exact_mut(2).zip(values) {
                dst.copy_from_slice(&f16::from_f32(*v).to_ne_bytes());
            }
        }
        BFloat16 => {
            for (dst, v) in out.chunks_exact_mut(2).zip(values) {
                dst.copy_from_slice(&bf16::from_f32(*v).to_ne_bytes());
            }
        }
        other => return Err(missing_conversion("write_from_f32", Float32, other)),
    }
    Ok(())
}

pub fn write_from_i32(values: &[i32], data_type: DataType, out: &mut [u8]) -> Result<()> {
    ensure(Int32, data_type)?;
    for (dst, v) in out.chunks_exact_mut(4).zip(values) {
        dst.copy_from_slice(&v.to_ne_bytes());
    }
    Ok(())
}
