//! Type promotion tables of the host kernels.

use nnrt::layer::cast::{PromotionRule, PromotionTable};
use nnrt::DataType::{self, *};

/// Binary elementwise ops. Mixed float/int pairs compute in `f32`; a
/// half-precision operand paired with `i32` keeps half precision.
pub static BINARY: PromotionTable = PromotionTable {
    name: "host_binary",
    rules: &[
        PromotionRule::uniform(Float32, Float32, Float32),
        PromotionRule::uniform(Float16, Float32, Float16),
        PromotionRule::uniform(BFloat16, Float32, BFloat16),
        PromotionRule::uniform(Int32, Int32, Int32),
        PromotionRule::exact(&[Float32, Float16], Float32, Float32),
        PromotionRule::exact(&[Float16, Float32], Float32, Float32),
        PromotionRule::exact(&[Float32, Int32], Float32, Float32),
        PromotionRule::exact(&[Int32, Float32], Float32, Float32),
        PromotionRule::exact(&[Float16, Int32], Float32, Float16),
        PromotionRule::exact(&[Int32, Float16], Float32, Float16),
    ],
};

/// Activations and other float-only compute.
pub static FLOAT: PromotionTable = PromotionTable {
    name: "host_float",
    rules: &[
        PromotionRule::uniform(Float32, Float32, Float32),
        PromotionRule::uniform(Float16, Float32, Float16),
        PromotionRule::uniform(BFloat16, Float32, BFloat16),
    ],
};

/// Fused chains compute in `f32` only.
pub static FUSED: PromotionTable = PromotionTable {
    name: "host_fused_elementwise",
    rules: &[
        PromotionRule::uniform(Float32, Float32, Float32),
        PromotionRule::uniform(Float16, Float32, Float16),
        PromotionRule::uniform(BFloat16, Float32, BFloat16),
        PromotionRule::exact(&[Float32, Float16], Float32, Float32),
        PromotionRule::exact(&[Float16, Float32], Float32, Float32),
        PromotionRule::exact(&[Float32, Int32], Float32, Float32),
        PromotionRule::exact(&[Int32, Float32], Float32, Float32),
    ],
};

/// Kernels that only move elements.
pub static MOVE: PromotionTable = PromotionTable {
    name: "host_move",
    rules: &[
        PromotionRule::uniform(Float32, Float32, Float32),
        PromotionRule::uniform(Float16, Float16, Float16),
        PromotionRule::uniform(BFloat16, BFloat16, BFloat16),
        PromotionRule::uniform(Int8, Int8, Int8),
        PromotionRule::uniform(UInt8, UInt8, UInt8),
        PromotionRule::uniform(Int32, Int32, Int32),
        PromotionRule::uniform(Int64, Int64, Int64),
    ],
};

/// Gather with `[data, indices]` blob inputs, or a single blob input when
/// the other operand lives in the layer resource.
pub static GATHER: PromotionTable = PromotionTable {
    name: "host_gather",
    rules: &[
        PromotionRule::exact(&[Float32, Int32], Float32, Float32).with_indices(&[1]),
        PromotionRule::exact(&[Float16, Int32], Float16, Float16).with_indices(&[1]),
        PromotionRule::exact(&[BFloat16, Int32], BFloat16, BFloat16).with_indices(&[1]),
        PromotionRule::exact(&[Int32, Int32], Int32, Int32).with_indices(&[1]),
        PromotionRule::exact(&[Float32], Float32, Float32),
        PromotionRule::exact(&[Float16], Float16, Float16),
        PromotionRule::exact(&[BFloat16], BFloat16, BFloat16),
        // Indices blob with data from the resource (dequantized to f32).
        PromotionRule::exact(&[Int32], Float32, Float32).with_indices(&[0]),
    ],
};

/// Every element type host memory can hold.
pub const HOST_DATA_TYPES: &[DataType] = &[
    Float32, Float16, BFloat16, Int8, UInt8, Int32, Int64,
];
