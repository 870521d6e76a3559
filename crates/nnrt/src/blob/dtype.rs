//! Element data types carried by blobs and raw buffers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar element type of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Int8,
    UInt8,
    Int32,
    Int64,
}

impl DataType {
    pub const ALL: [DataType; 7] = [
        DataType::Float32,
        DataType::Float16,
        DataType::BFloat16,
        DataType::Int8,
        DataType::UInt8,
        DataType::Int32,
        DataType::Int64,
    ];

    /// Bytes one element occupies in host and device storage.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float16 | DataType::BFloat16 => 2,
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float16 | DataType::BFloat16
        )
    }

    pub fn is_integer(self) -> bool {
        !self.is_float()
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Float16 => "float16",
            DataType::BFloat16 => "bfloat16",
            DataType::Int8 => "int8",
            DataType::UInt8 => "uint8",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
