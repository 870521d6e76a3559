extern crate self as nnrt;

pub use linkme;

pub mod blob;
pub mod config;
pub mod device;
mod env;
pub mod graph;
pub mod layer;
pub mod network;
pub mod optimizer;
pub mod registry;
pub mod status;

pub use blob::{Blob, BlobDesc, BlobHandle, DataFormat, DataType, DimsVector};
pub use config::{ForwardMemoryPolicy, ModelConfig, NetworkConfig, QuantizationMode};
pub use device::{Context, Device, DeviceCapabilities, DeviceHandle, DeviceMemory, DeviceType};
pub use graph::{Graph, LayerInfo, NetResource, NetStructure};
pub use layer::{LayerParam, LayerResource, LayerType};
pub use network::{BlobMap, Network, NetworkState};
pub use registry::{Registry, RegistryBuilder};
pub use status::{ErrorKind, Result, Status};
