use std::fmt;

use serde::{Deserialize, Serialize};

/// Physical arrangement of a blob's elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// Canonical row-major layout; every graph input and output uses it.
    Nchw,
    /// Channels packed in groups of four, channel count rounded up to a
    /// multiple of four. See [`crate::blob::layout`].
    Nc4hw4,
    Nhwc,
    /// Vendor layout owned by a device; only that device can interpret it.
    Opaque,
}

impl DataFormat {
    pub fn name(self) -> &'static str {
        match self {
            DataFormat::Nchw => "nchw",
            DataFormat::Nc4hw4 => "nc4hw4",
            DataFormat::Nhwc => "nhwc",
            DataFormat::Opaque => "opaque",
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
