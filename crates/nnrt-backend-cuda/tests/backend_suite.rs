use nnrt::registry::RegistryBuilder;
use nnrt::{DeviceType, ErrorKind, LayerType, NetworkConfig};
use nnrt_backend_tests::{graphs, Harness};

fn harness_or_skip() -> Option<Harness> {
    if !nnrt_backend_cuda::is_available() {
        eprintln!("skipping cuda backend test: CUDA runtime unavailable");
        return None;
    }
    let mut builder = RegistryBuilder::new();
    nnrt_backend_cuda::register_cuda_backend(&mut builder).unwrap();
    Some(Harness::new(DeviceType::Cuda, builder.build().unwrap()))
}

nnrt_backend_tests::define_backend_tests!(cuda_smoke, harness_or_skip);

#[test]
fn registration_does_not_need_a_driver() {
    let mut builder = RegistryBuilder::new();
    nnrt_backend_cuda::register_cuda_backend(&mut builder).unwrap();
    let registry = builder.build().unwrap();
    assert!(registry.has_device(DeviceType::Cuda));
    assert!(registry.has_kernel(LayerType::FusedElementwise, DeviceType::Cuda));
    assert!(!registry.has_kernel(LayerType::Convolution, DeviceType::Cuda));
}

#[test]
fn missing_driver_is_a_device_error() {
    if nnrt_backend_cuda::is_available() {
        return;
    }
    let mut builder = RegistryBuilder::new();
    nnrt_backend_cuda::register_cuda_backend(&mut builder).unwrap();
    let registry = builder.build().unwrap();
    let mut network = nnrt::Network::new();
    let err = network
        .init(
            &registry,
            &NetworkConfig::for_device(DeviceType::Cuda),
            &nnrt::ModelConfig::default(),
            &graphs::binary(LayerType::Add, &[4]),
            &Default::default(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert_eq!(network.state(), nnrt::NetworkState::Uninitialized);
}

#[test]
fn broadcasting_is_rejected_at_init() {
    let Some(h) = harness_or_skip() else {
        return;
    };
    let mut structure = nnrt::NetStructure::default();
    structure
        .add_input("a", &[2, 3], nnrt::DataType::Float32)
        .add_input("b", &[1, 3], nnrt::DataType::Float32)
        .add_output("out")
        .push_layer(nnrt::LayerInfo::new(
            LayerType::Add,
            "op",
            &["a", "b"],
            &["out"],
            graphs::elementwise_param(LayerType::Add),
        ));
    let graph = nnrt::Graph::new(structure, nnrt::NetResource::default());
    let err = h.build(&graph).unwrap_err();
    let status = err.downcast_ref::<nnrt::Status>().unwrap();
    assert_eq!(status.kind(), ErrorKind::DeviceNotSupported);
}
