use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;

use nnrt::layer::param::ElementwiseParam;
use nnrt::{
    DataFormat, DataType, DeviceType, DimsVector, ErrorKind, ForwardMemoryPolicy, Graph,
    LayerInfo, LayerParam, LayerType, ModelConfig, NetResource, NetStructure, Network,
    NetworkConfig, NetworkState, Registry, RegistryBuilder,
};
use nnrt_backend_naive::kernels::reference_registrations;
use nnrt_backend_naive::{host_capabilities, register_naive_backend, HostDevice};

const FIXED: DeviceType = DeviceType::Custom(50);

fn registry() -> Registry {
    let mut builder = RegistryBuilder::new();
    register_naive_backend(&mut builder).unwrap();
    let mut caps = host_capabilities(DataFormat::Nchw);
    caps.supports_reshape = false;
    caps.supports_external_forward_memory = false;
    builder
        .register_device(Arc::new(HostDevice::new(FIXED, "fixed", caps)))
        .unwrap();
    builder
        .register_kernels(&reference_registrations(FIXED, &[]))
        .unwrap();
    builder.build().unwrap()
}

/// out = relu(a + b)
fn add_relu() -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("a", &[1, 2, 1, 2], DataType::Float32)
        .add_input("b", &[1, 2, 1, 2], DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Add,
            "add",
            &["a", "b"],
            &["sum"],
            LayerParam::Elementwise(ElementwiseParam::default()),
        ))
        .push_layer(LayerInfo::new(
            LayerType::Relu,
            "relu",
            &["sum"],
            &["out"],
            LayerParam::None,
        ));
    Graph::new(structure, NetResource::default())
}

fn dims(values: &[usize]) -> DimsVector {
    DimsVector::from_slice(values)
}

fn init(registry: &Registry, config: &NetworkConfig) -> Network {
    let mut network = Network::new();
    network
        .init(registry, config, &ModelConfig::default(), &add_relu(), &BTreeMap::new())
        .unwrap();
    network
}

fn write(network: &Network, name: &str, values: &[f32]) {
    let device = network.device_handle().unwrap();
    device.write_blob(network.blob(name).unwrap(), values).unwrap();
}

fn read(network: &Network, name: &str) -> Vec<f32> {
    let device = network.device_handle().unwrap();
    device.read_blob(network.blob(name).unwrap()).unwrap()
}

#[test]
fn forward_computes_declared_outputs() {
    let registry = registry();
    let mut network = init(&registry, &NetworkConfig::default());
    assert_eq!(network.state(), NetworkState::Ready);

    write(&network, "a", &[1.0, -2.0, 3.0, -4.0]);
    write(&network, "b", &[0.5, 0.5, -5.0, 5.0]);
    network.forward().unwrap();
    assert_eq!(read(&network, "out"), [1.5, 0.0, 0.0, 1.0]);

    let inputs: Vec<String> = network.get_all_input_blobs().into_keys().collect();
    let outputs: Vec<String> = network.get_all_output_blobs().into_keys().collect();
    assert_eq!(inputs, ["a", "b"]);
    assert_eq!(outputs, ["out"]);
}

#[test]
fn lifecycle_is_enforced() {
    let registry = registry();
    let mut network = Network::new();
    assert_eq!(network.state(), NetworkState::Uninitialized);
    assert_eq!(network.forward().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(
        network.get_forward_memory_size().unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    network
        .init(
            &registry,
            &NetworkConfig::default(),
            &ModelConfig::default(),
            &add_relu(),
            &BTreeMap::new(),
        )
        .unwrap();
    let err = network
        .init(
            &registry,
            &NetworkConfig::default(),
            &ModelConfig::default(),
            &add_relu(),
            &BTreeMap::new(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(network.state(), NetworkState::Ready);

    network.deinit();
    assert_eq!(network.state(), NetworkState::Deinitialized);
    assert!(network.blobs().is_empty());
    assert!(network.graph().is_none());
    assert_eq!(network.forward().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(
        network.reshape(&BTreeMap::new()).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn unregistered_device_leaves_network_uninitialized() {
    let registry = registry();
    let mut network = Network::new();
    let err = network
        .init(
            &registry,
            &NetworkConfig::for_device(DeviceType::Metal),
            &ModelConfig::default(),
            &add_relu(),
            &BTreeMap::new(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownDevice);
    assert_eq!(network.state(), NetworkState::Uninitialized);
}

#[test]
fn reshape_grows_blobs_and_recomputes() {
    let registry = registry();
    let mut network = init(&registry, &NetworkConfig::default());
    let shapes: BTreeMap<String, DimsVector> = [
        ("a".to_string(), dims(&[1, 2, 2, 2])),
        ("b".to_string(), dims(&[1, 2, 2, 2])),
    ]
    .into_iter()
    .collect();
    network.reshape(&shapes).unwrap();
    assert_eq!(network.state(), NetworkState::Ready);
    assert_eq!(network.input_shapes()["a"].as_slice(), &[1, 2, 2, 2]);
    assert_eq!(network.blob("out").unwrap().dims(), &[1, 2, 2, 2]);

    let a: Vec<f32> = (0..8).map(|i| i as f32 - 4.0).collect();
    write(&network, "a", &a);
    write(&network, "b", &[1.0; 8]);
    network.forward().unwrap();
    assert_eq!(
        read(&network, "out"),
        [0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0]
    );
}

#[test]
fn reshape_rejects_unknown_inputs() {
    let registry = registry();
    let mut network = init(&registry, &NetworkConfig::default());
    let shapes: BTreeMap<String, DimsVector> =
        [("sum".to_string(), dims(&[1, 2, 1, 2]))].into_iter().collect();
    let err = network.reshape(&shapes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    assert_eq!(network.state(), NetworkState::Ready);
}

#[test]
fn fixed_shape_device_refuses_reshape_and_external_memory() {
    let registry = registry();
    let mut network = init(&registry, &NetworkConfig::for_device(FIXED));
    let shapes: BTreeMap<String, DimsVector> =
        [("a".to_string(), dims(&[1, 2, 2, 2]))].into_iter().collect();
    let err = network.reshape(&shapes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotSupported);
    assert_eq!(network.state(), NetworkState::Ready);

    let memory = network.device_handle().unwrap().allocate(1024).unwrap();
    let err = network.set_forward_memory(memory).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceNotSupported);
    assert_eq!(network.state(), NetworkState::Ready);
}

#[test]
fn external_forward_memory_gates_forward() {
    let registry = registry();
    let config = NetworkConfig {
        forward_memory_policy: ForwardMemoryPolicy::SetFromExternal,
        disabled_optimizers: vec!["elementwise_fusion".to_string()],
        ..NetworkConfig::default()
    };
    let mut network = init(&registry, &config);
    assert_eq!(network.state(), NetworkState::Initialized);
    assert_eq!(network.forward().unwrap_err().kind(), ErrorKind::InvalidState);

    let needed = network.get_forward_memory_size().unwrap();
    assert_eq!(needed, 64);
    let device = network.device_handle().unwrap().clone();

    let err = network
        .set_forward_memory(device.allocate(needed / 2).unwrap())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    assert_eq!(network.state(), NetworkState::Initialized);

    network
        .set_forward_memory(device.allocate(needed).unwrap())
        .unwrap();
    assert_eq!(network.state(), NetworkState::Ready);
    write(&network, "a", &[1.0, 2.0, 3.0, 4.0]);
    write(&network, "b", &[-2.0, -2.0, -2.0, -2.0]);
    network.forward().unwrap();
    assert_eq!(read(&network, "out"), [0.0, 0.0, 1.0, 2.0]);
}

#[test]
fn reshape_beyond_external_forward_memory_keeps_engine_intact() {
    let registry = registry();
    let config = NetworkConfig {
        forward_memory_policy: ForwardMemoryPolicy::SetFromExternal,
        disabled_optimizers: vec!["elementwise_fusion".to_string()],
        ..NetworkConfig::default()
    };
    let mut network = init(&registry, &config);
    let needed = network.get_forward_memory_size().unwrap();
    let device = network.device_handle().unwrap().clone();
    network
        .set_forward_memory(device.allocate(needed).unwrap())
        .unwrap();

    let shapes: BTreeMap<String, DimsVector> = [
        ("a".to_string(), dims(&[1, 2, 8, 2])),
        ("b".to_string(), dims(&[1, 2, 8, 2])),
    ]
    .into_iter()
    .collect();
    let err = network.reshape(&shapes).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    assert_eq!(network.state(), NetworkState::Ready);
    assert_eq!(network.input_shapes()["a"].as_slice(), &[1, 2, 1, 2]);
    assert_eq!(network.blob("a").unwrap().dims(), &[1, 2, 1, 2]);
    assert_eq!(network.get_forward_memory_size().unwrap(), needed);

    write(&network, "a", &[1.0, 2.0, 3.0, 4.0]);
    write(&network, "b", &[-2.0, -2.0, -2.0, -2.0]);
    network.forward().unwrap();
    assert_eq!(read(&network, "out"), [0.0, 0.0, 1.0, 2.0]);
}

#[test]
fn forward_memory_shrinks_with_reuse() {
    let registry = registry();
    let mut structure = NetStructure::default();
    structure
        .add_input("x", &[1, 16], DataType::Float32)
        .add_output("out");
    let names = ["x", "t0", "t1", "t2", "out"];
    for (i, pair) in names.windows(2).enumerate() {
        let layer_type = if i % 2 == 0 { LayerType::Relu } else { LayerType::Neg };
        structure.push_layer(LayerInfo::new(
            layer_type,
            &format!("l{i}"),
            &[pair[0]],
            &[pair[1]],
            LayerParam::None,
        ));
    }
    let graph = Graph::new(structure, NetResource::default());

    let size_for = |policy: ForwardMemoryPolicy| {
        let config = NetworkConfig {
            forward_memory_policy: policy,
            disabled_optimizers: vec!["elementwise_fusion".to_string()],
            ..NetworkConfig::default()
        };
        let mut network = Network::new();
        network
            .init(&registry, &config, &ModelConfig::default(), &graph, &BTreeMap::new())
            .unwrap();
        network.get_forward_memory_size().unwrap()
    };
    assert_eq!(size_for(ForwardMemoryPolicy::Reuse), 2 * 64);
    assert_eq!(size_for(ForwardMemoryPolicy::NoReuse), 3 * 64);
}

#[test]
fn model_config_overrides_input_shapes() {
    let registry = registry();
    let model = ModelConfig {
        input_shapes: [
            ("a".to_string(), dims(&[2, 2, 1, 2])),
            ("b".to_string(), dims(&[2, 2, 1, 2])),
        ]
        .into_iter()
        .collect(),
        ..ModelConfig::default()
    };
    let mut network = Network::new();
    network
        .init(&registry, &NetworkConfig::default(), &model, &add_relu(), &BTreeMap::new())
        .unwrap();
    assert_eq!(network.blob("out").unwrap().dims(), &[2, 2, 1, 2]);
}

#[test]
fn override_for_unknown_input_fails_init() {
    let registry = registry();
    let overrides: BTreeMap<String, DimsVector> =
        [("missing".to_string(), dims(&[1]))].into_iter().collect();
    let mut network = Network::new();
    let err = network
        .init(
            &registry,
            &NetworkConfig::default(),
            &ModelConfig::default(),
            &add_relu(),
            &overrides,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    assert_eq!(network.state(), NetworkState::Deinitialized);
}

#[test]
fn synchronous_device_runs_async_forward_inline() {
    let registry = registry();
    let mut network = init(&registry, &NetworkConfig::default());
    assert!(!network.supports_async_forward());
    write(&network, "a", &[1.0; 4]);
    write(&network, "b", &[1.0; 4]);

    let (tx, rx) = mpsc::channel();
    network
        .forward_async(move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
    assert!(rx.try_recv().unwrap().is_ok());
    assert_eq!(read(&network, "out"), [2.0; 4]);
}
