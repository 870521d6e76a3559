//! Execution engine.
//!
//! A [`Network`] owns one device context, the optimized graph, the blob
//! map and one kernel per layer. Life cycle:
//!
//! ```text
//! Uninitialized --init--> Initialized --(forward memory bound)--> Ready
//!        any state --deinit / failed init--> Deinitialized
//! ```
//!
//! `init` leaves the engine `Initialized` only when the forward memory
//! policy is `SetFromExternal` and no buffer was supplied yet.

mod memory_plan;
mod shape_inference;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub use memory_plan::{
    live_ranges, LiveRange, MemoryPlan, MemorySlot, Placement, TensorPlan,
    FORWARD_MEMORY_ALIGNMENT,
};
pub use shape_inference::{
    infer_data_types, infer_layer, infer_shapes, matmul_shape, reshape_shape, with_constant_type,
    TypePlan,
};

use crate::blob::{Blob, BlobDesc, BlobHandle, DataFormat, DimsVector};
use crate::config::{ForwardMemoryPolicy, ModelConfig, NetworkConfig};
use crate::device::{DeviceHandle, DeviceMemory};
use crate::graph::{Graph, LayerInfo, NetStructure};
use crate::layer::{KernelContext, KernelRegistration, LayerAcc, LayerParam, LayerType};
use crate::optimizer::{OptimizeContext, OptimizerPipeline};
use crate::registry::Registry;
use crate::status::{Result, Status};

pub type BlobMap = BTreeMap<String, Blob>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Uninitialized,
    /// Kernels are bound but forward memory is not.
    Initialized,
    /// `forward` may be called.
    Ready,
    /// Terminal; only drop is meaningful.
    Deinitialized,
}

struct BoundLayer {
    info: LayerInfo,
    acc: Box<dyn LayerAcc>,
    inputs: Vec<Blob>,
    outputs: Vec<Blob>,
}

enum ForwardMemory {
    Unbound,
    Owned(Arc<dyn DeviceMemory>),
    External(Arc<dyn DeviceMemory>),
}

impl ForwardMemory {
    fn memory(&self) -> Option<&Arc<dyn DeviceMemory>> {
        match self {
            ForwardMemory::Unbound => None,
            ForwardMemory::Owned(m) | ForwardMemory::External(m) => Some(m),
        }
    }
}

pub struct Network {
    state: NetworkState,
    config: NetworkConfig,
    device: Option<DeviceHandle>,
    graph: Option<Graph>,
    input_shapes: BTreeMap<String, DimsVector>,
    types: Option<TypePlan>,
    formats: BTreeMap<String, DataFormat>,
    descs: BTreeMap<String, BlobDesc>,
    plan: Option<MemoryPlan>,
    blobs: BlobMap,
    layers: Vec<BoundLayer>,
    forward_memory: ForwardMemory,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Network {
            state: NetworkState::Uninitialized,
            config: NetworkConfig::default(),
            device: None,
            graph: None,
            input_shapes: BTreeMap::new(),
            types: None,
            formats: BTreeMap::new(),
            descs: BTreeMap::new(),
            plan: None,
            blobs: BlobMap::new(),
            layers: Vec::new(),
            forward_memory: ForwardMemory::Unbound,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    /// Opens the device, optimizes `graph`, binds kernels, infers shapes
    /// and allocates memory.
    ///
    /// A device that cannot be resolved or opened leaves the engine
    /// `Uninitialized`. Any later failure releases everything and leaves it
    /// `Deinitialized`.
    pub fn init(
        &mut self,
        registry: &Registry,
        net_config: &NetworkConfig,
        model_config: &ModelConfig,
        graph: &Graph,
        input_shape_overrides: &BTreeMap<String, DimsVector>,
    ) -> Result<()> {
        if self.state != NetworkState::Uninitialized {
            return Err(Status::invalid_state(format!(
                "init called on a {:?} network",
                self.state
            )));
        }
        let device = registry.device(net_config.device_type)?;
        let handle = DeviceHandle::open(device, net_config.device_id)?;
        tracing::info!(
            device = %net_config.device_type,
            device_id = net_config.device_id,
            "opened device context"
        );
        self.config = net_config.clone();
        self.device = Some(handle);

        match self.build(registry, model_config, graph, input_shape_overrides) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(error = %err, "network init failed");
                self.release();
                Err(err)
            }
        }
    }

    fn build(
        &mut self,
        registry: &Registry,
        model_config: &ModelConfig,
        graph: &Graph,
        overrides: &BTreeMap<String, DimsVector>,
    ) -> Result<()> {
        let device = self.device_handle_or_err()?.clone();
        let device_type = self.config.device_type;

        let mut working = graph.clone();
        apply_input_overrides(&mut working.structure, model_config, overrides)?;
        working.validate()?;

        let cx = OptimizeContext::new(registry, &self.config, model_config);
        let optimized = OptimizerPipeline::default_order().run(&working, &cx)?;
        let structure = &optimized.structure;

        let registrations = structure
            .layers
            .iter()
            .map(|layer| registry.kernel(layer.layer_type, device_type).copied())
            .collect::<Result<Vec<KernelRegistration>>>()?;
        let types = infer_data_types(structure, &optimized.resource, registry, device_type)?;
        let formats = resolve_formats(structure, &registrations)?;

        let input_shapes = structure.inputs_shape_map.clone();
        let shapes = infer_shapes(structure, &optimized.resource, &input_shapes)?;
        let descs = describe(&device, &shapes, &types, &formats);
        let plan = MemoryPlan::build(
            structure,
            &byte_sizes(&descs),
            self.config.effective_memory_policy(),
        );
        tracing::debug!(
            layers = structure.layers.len(),
            slots = plan.slots.len(),
            forward_memory = plan.forward_memory_size(),
            unshared = plan.unshared_size(),
            dedicated = plan.dedicated_size(),
            "memory plan"
        );

        let mut blobs = BlobMap::new();
        for (name, tensor) in &plan.tensors {
            if tensor.placement == Placement::Dedicated {
                if let Some(desc) = descs.get(name) {
                    blobs.insert(name.clone(), Blob::allocate(desc.clone(), &device)?);
                }
            }
        }

        let mut layers = Vec::with_capacity(structure.layers.len());
        for (idx, (layer, registration)) in structure.layers.iter().zip(&registrations).enumerate() {
            let input_descs = lookup_descs(&descs, &layer.inputs)?;
            let output_descs = lookup_descs(&descs, &layer.outputs)?;
            let kcx = KernelContext {
                layer,
                resource: optimized.resource.get(&layer.name),
                device: &device,
                promotion: &types.rules[idx],
                inputs: &input_descs,
                outputs: &output_descs,
            };
            let acc = (registration.create)(&kcx)?;
            layers.push(BoundLayer {
                info: layer.clone(),
                acc,
                inputs: Vec::new(),
                outputs: Vec::new(),
            });
        }

        self.input_shapes = input_shapes;
        self.types = Some(types);
        self.formats = formats;
        self.descs = descs;
        self.blobs = blobs;
        self.layers = layers;
        self.graph = Some(optimized);
        self.state = NetworkState::Initialized;

        if self.config.forward_memory_policy != ForwardMemoryPolicy::SetFromExternal {
            let memory = device.allocate(plan.forward_memory_size())?;
            self.forward_memory = ForwardMemory::Owned(memory);
        }
        self.plan = Some(plan);
        self.bind_forward_memory()?;
        tracing::info!(state = ?self.state, layers = self.layers.len(), "network initialized");
        Ok(())
    }

    /// Changes graph input shapes, re-infers every shape and re-plans
    /// memory. Kernels are kept and only re-derive shape-dependent state.
    pub fn reshape(&mut self, input_shapes: &BTreeMap<String, DimsVector>) -> Result<()> {
        self.ensure_built()?;
        let device = self.device_handle_or_err()?.clone();
        if !device.capabilities().supports_reshape {
            return Err(Status::device_not_supported(device.device_type(), "reshape"));
        }
        let (Some(graph), Some(types)) = (self.graph.as_ref(), self.types.as_ref()) else {
            return Err(Status::invalid_state("network has no graph"));
        };

        let mut new_inputs = self.input_shapes.clone();
        for (name, dims) in input_shapes {
            if !graph.structure.is_input(name) {
                return Err(Status::param(format!("'{name}' is not a graph input")));
            }
            new_inputs.insert(name.clone(), dims.clone());
        }
        let shapes = infer_shapes(&graph.structure, &graph.resource, &new_inputs)?;
        let descs = describe(&device, &shapes, types, &self.formats);
        let plan = MemoryPlan::build(
            &graph.structure,
            &byte_sizes(&descs),
            self.config.effective_memory_policy(),
        );

        let needed = plan.forward_memory_size();
        let forward_memory = match &self.forward_memory {
            ForwardMemory::External(memory) if memory.byte_len() < needed => {
                return Err(Status::param(format!(
                    "external forward memory holds {} bytes, reshape needs {needed}",
                    memory.byte_len()
                )));
            }
            ForwardMemory::External(memory) => ForwardMemory::External(Arc::clone(memory)),
            ForwardMemory::Owned(memory) if memory.byte_len() >= needed => {
                ForwardMemory::Owned(Arc::clone(memory))
            }
            ForwardMemory::Owned(_) => ForwardMemory::Owned(device.allocate(needed)?),
            ForwardMemory::Unbound => ForwardMemory::Unbound,
        };

        // Reshape copies so a failure leaves the current blobs intact.
        let mut staged = Vec::new();
        for (name, tensor) in &plan.tensors {
            if tensor.placement != Placement::Dedicated {
                continue;
            }
            if let (Some(blob), Some(desc)) = (self.blobs.get(name), descs.get(name)) {
                let mut blob = blob.clone();
                blob.reshape(&desc.dims)?;
                staged.push((name.clone(), blob));
            }
        }

        self.blobs.extend(staged);
        self.forward_memory = forward_memory;
        self.input_shapes = new_inputs;
        self.descs = descs;
        self.plan = Some(plan);
        self.state = NetworkState::Initialized;
        self.bind_forward_memory()
    }

    /// Runs every kernel in topological order and waits for completion.
    /// The first kernel error aborts the pass and is returned unchanged.
    pub fn forward(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let device = self.device_handle_or_err()?.clone();
        self.run_layers(&device)?;
        device.synchronize()
    }

    /// Whether `forward_async` overlaps with the caller. When `false`, the
    /// call runs `forward` synchronously and invokes the callback before
    /// returning.
    pub fn supports_async_forward(&self) -> bool {
        self.device
            .as_ref()
            .is_some_and(|device| device.capabilities().supports_async_forward)
    }

    /// Submits a forward pass; `callback` receives what `forward` would
    /// have returned and is called exactly once.
    ///
    /// An error is returned directly, without calling `callback`, only when
    /// the engine is not `Ready`.
    pub fn forward_async<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.ensure_ready()?;
        let device = self.device_handle_or_err()?.clone();
        if !device.capabilities().supports_async_forward {
            tracing::debug!(device = %device.device_type(), "forward_async runs synchronously on this device");
            callback(self.forward());
            return Ok(());
        }
        match self.run_layers(&device) {
            Ok(()) => device
                .device()
                .notify_on_completion(device.context(), Box::new(callback)),
            Err(err) => callback(Err(err)),
        }
        Ok(())
    }

    pub fn get_all_input_blobs(&self) -> BlobMap {
        self.select_blobs(|structure, name| structure.is_input(name))
    }

    pub fn get_all_output_blobs(&self) -> BlobMap {
        self.select_blobs(|structure, name| structure.is_output(name))
    }

    /// Bytes of forward memory the current plan needs.
    pub fn get_forward_memory_size(&self) -> Result<usize> {
        self.ensure_built()?;
        Ok(self.plan.as_ref().map_or(0, MemoryPlan::forward_memory_size))
    }

    /// Replaces engine-owned forward memory with `memory`, which must hold
    /// at least [`Network::get_forward_memory_size`] bytes.
    pub fn set_forward_memory(&mut self, memory: Arc<dyn DeviceMemory>) -> Result<()> {
        let device = self.device_handle_or_err()?.clone();
        if !device.capabilities().supports_external_forward_memory {
            return Err(Status::device_not_supported(
                device.device_type(),
                "external forward memory",
            ));
        }
        self.ensure_built()?;
        let memory = device.device().import_memory(memory)?;
        let needed = self.get_forward_memory_size()?;
        if memory.byte_len() < needed {
            return Err(Status::param(format!(
                "forward memory holds {} bytes, plan needs {needed}",
                memory.byte_len()
            )));
        }
        self.forward_memory = ForwardMemory::External(memory);
        self.state = NetworkState::Initialized;
        self.bind_forward_memory()
    }

    /// Synchronizes and releases every kernel, blob and allocation.
    pub fn deinit(&mut self) {
        self.release();
    }

    pub fn graph(&self) -> Option<&Graph> {
        self.graph.as_ref()
    }

    pub fn memory_plan(&self) -> Option<&MemoryPlan> {
        self.plan.as_ref()
    }

    pub fn device_handle(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn blob(&self, name: &str) -> Option<&Blob> {
        self.blobs.get(name)
    }

    pub fn blobs(&self) -> &BlobMap {
        &self.blobs
    }

    pub fn input_shapes(&self) -> &BTreeMap<String, DimsVector> {
        &self.input_shapes
    }

    fn select_blobs(&self, keep: impl Fn(&NetStructure, &str) -> bool) -> BlobMap {
        let Some(graph) = self.graph.as_ref() else {
            return BlobMap::new();
        };
        self.blobs
            .iter()
            .filter(|(name, _)| keep(&graph.structure, name))
            .map(|(name, blob)| (name.clone(), blob.clone()))
            .collect()
    }

    fn run_layers(&mut self, device: &DeviceHandle) -> Result<()> {
        for layer in &mut self.layers {
            tracing::trace!(layer = %layer.info.name, kind = %layer.info.layer_type, "forward");
            if let Err(err) = layer.acc.forward(device, &layer.inputs, &layer.outputs) {
                tracing::error!(layer = %layer.info.name, error = %err, "kernel failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Points shared intermediates at forward memory and refreshes each
    /// kernel's blobs. Moves the engine to `Ready` when memory is bound.
    fn bind_forward_memory(&mut self) -> Result<()> {
        let Some(plan) = self.plan.as_ref() else {
            return Err(Status::invalid_state("network has no memory plan"));
        };
        let Some(memory) = self.forward_memory.memory().cloned() else {
            return Ok(());
        };
        for (name, tensor) in &plan.tensors {
            let Placement::Shared { slot } = tensor.placement else {
                continue;
            };
            let (Some(desc), Some(slot)) = (self.descs.get(name), plan.slots.get(slot)) else {
                continue;
            };
            let handle = BlobHandle::with_offset(Arc::clone(&memory), slot.offset);
            self.blobs
                .insert(name.clone(), Blob::view(desc.clone(), handle, slot.size)?);
        }

        for layer in &mut self.layers {
            layer.inputs = collect_blobs(&self.blobs, &layer.info.inputs)?;
            layer.outputs = collect_blobs(&self.blobs, &layer.info.outputs)?;
        }
        let failed = self.layers.iter_mut().find_map(|layer| {
            layer
                .acc
                .reshape(&layer.inputs, &layer.outputs)
                .err()
                .map(|err| (layer.info.name.clone(), err))
        });
        if let Some((layer, err)) = failed {
            tracing::error!(layer = %layer, error = %err, "kernel reshape failed");
            self.release();
            return Err(err);
        }
        self.state = NetworkState::Ready;
        Ok(())
    }

    fn release(&mut self) {
        if let Some(device) = self.device.as_ref() {
            if let Err(err) = device.synchronize() {
                tracing::warn!(error = %err, "synchronize during teardown failed");
            }
        }
        self.layers.clear();
        self.blobs.clear();
        self.descs.clear();
        self.formats.clear();
        self.plan = None;
        self.types = None;
        self.graph = None;
        self.forward_memory = ForwardMemory::Unbound;
        self.device = None;
        self.state = NetworkState::Deinitialized;
    }

    fn device_handle_or_err(&self) -> Result<&DeviceHandle> {
        self.device
            .as_ref()
            .ok_or_else(|| Status::invalid_state(format!("network is {:?}", self.state)))
    }

    fn ensure_built(&self) -> Result<()> {
        match self.state {
            NetworkState::Initialized | NetworkState::Ready => Ok(()),
            state => Err(Status::invalid_state(format!("network is {state:?}"))),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            NetworkState::Ready => Ok(()),
            NetworkState::Initialized => Err(Status::invalid_state(
                "forward memory is not bound; call set_forward_memory",
            )),
            state => Err(Status::invalid_state(format!("network is {state:?}"))),
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if self.device.is_some() {
            self.release();
        }
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("state", &self.state)
            .field("device", &self.config.device_type)
            .field("layers", &self.layers.len())
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

fn apply_input_overrides(
    structure: &mut NetStructure,
    model_config: &ModelConfig,
    overrides: &BTreeMap<String, DimsVector>,
) -> Result<()> {
    for (name, dims) in model_config.input_shapes.iter().chain(overrides) {
        if !structure.is_input(name) {
            return Err(Status::param(format!("'{name}' is not a graph input")));
        }
        structure.inputs_shape_map.insert(name.clone(), dims.clone());
    }
    for (name, data_type) in &model_config.input_data_types {
        if !structure.is_input(name) {
            return Err(Status::param(format!("'{name}' is not a graph input")));
        }
        structure.input_data_type_map.insert(name.clone(), *data_type);
    }
    Ok(())
}

/// Layout of every tensor given the bound kernels. Graph inputs and
/// outputs are `Nchw`; every kernel must receive its declared layout.
fn resolve_formats(
    structure: &NetStructure,
    registrations: &[KernelRegistration],
) -> Result<BTreeMap<String, DataFormat>> {
    let mut formats: BTreeMap<String, DataFormat> = structure
        .inputs_shape_map
        .keys()
        .map(|name| (name.clone(), DataFormat::Nchw))
        .collect();
    for (layer, registration) in structure.layers.iter().zip(registrations) {
        let (expected, produced) = match (&layer.layer_type, &layer.param) {
            (LayerType::LayoutConvert, LayerParam::LayoutConvert(p)) => (p.src_format, p.dst_format),
            _ => (registration.data_format, registration.data_format),
        };
        for input in &layer.inputs {
            let actual = formats.get(input).copied().unwrap_or(DataFormat::Nchw);
            if actual != expected {
                return Err(Status::unsupported_format(format!(
                    "layer '{}' reads '{}' in {}, but it is produced in {}",
                    layer.name, input, expected, actual
                )));
            }
        }
        for output in &layer.outputs {
            formats.insert(output.clone(), produced);
        }
    }
    for output in &structure.outputs {
        let format = formats.get(output).copied().unwrap_or(DataFormat::Nchw);
        if format != DataFormat::Nchw {
            return Err(Status::unsupported_format(format!(
                "graph output '{output}' is produced in {format}"
            )));
        }
    }
    Ok(formats)
}

fn describe(
    device: &DeviceHandle,
    shapes: &BTreeMap<String, DimsVector>,
    types: &TypePlan,
    formats: &BTreeMap<String, DataFormat>,
) -> BTreeMap<String, BlobDesc> {
    shapes
        .iter()
        .map(|(name, dims)| {
            let desc = BlobDesc {
                device_type: device.device_type(),
                data_type: types.data_type(name),
                data_format: formats.get(name).copied().unwrap_or(DataFormat::Nchw),
                dims: dims.clone(),
                name: name.clone(),
            };
            (name.clone(), desc)
        })
        .collect()
}

fn byte_sizes(descs: &BTreeMap<String, BlobDesc>) -> BTreeMap<String, usize> {
    descs
        .iter()
        .map(|(name, desc)| (name.clone(), desc.byte_size()))
        .collect()
}

fn lookup_descs(descs: &BTreeMap<String, BlobDesc>, names: &[String]) -> Result<Vec<BlobDesc>> {
    names
        .iter()
        .map(|name| {
            descs
                .get(name)
                .cloned()
                .ok_or_else(|| Status::graph(format!("tensor '{name}' has no shape")))
        })
        .collect()
}

fn collect_blobs(blobs: &BlobMap, names: &[String]) -> Result<Vec<Blob>> {
    names
        .iter()
        .map(|name| {
            blobs
                .get(name)
                .cloned()
                .ok_or_else(|| Status::invalid_state(format!("tensor '{name}' has no blob")))
        })
        .collect()
}
