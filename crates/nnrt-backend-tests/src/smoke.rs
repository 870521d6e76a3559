//! Engine scenarios every backend must pass. They only use same-shape
//! `f32` elementwise layers, which every device implements.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use nnrt::{
    DimsVector, ErrorKind, ForwardMemoryPolicy, LayerType, ModelConfig, Network, NetworkState,
};

use crate::graphs;
use crate::harness::{assert_close, random_values, read_f32, run, write, Harness};

const TOLERANCE: f32 = 1e-5;
/// Device transcendental functions may use approximations.
const ACTIVATION_TOLERANCE: f32 = 1e-4;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn no_fusion(h: &Harness) -> nnrt::NetworkConfig {
    let mut config = h.config();
    config.disabled_optimizers = vec!["elementwise_fusion".to_string()];
    config
}

pub fn add_produces_expected_values(h: &Harness) {
    let dims = [1, 3, 4, 4];
    let mut network = h.build(&graphs::binary(LayerType::Add, &dims)).unwrap();
    assert_eq!(network.state(), NetworkState::Ready);

    let inputs = network.get_all_input_blobs();
    assert_eq!(inputs.keys().collect::<Vec<_>>(), ["a", "b"]);
    let outputs = network.get_all_output_blobs();
    assert_eq!(outputs.keys().collect::<Vec<_>>(), ["out"]);
    assert_eq!(outputs["out"].dims(), &dims);

    let ones = vec![1.0f32; 48];
    let out = run(&mut network, &[("a", &ones), ("b", &ones)], "out").unwrap();
    assert_eq!(out.len(), 48);
    assert!(out.iter().all(|&v| v == 2.0), "{out:?}");
}

pub fn fused_chain_matches_unfused(h: &Harness) {
    let dims = [2, 3, 5, 5];
    let count = 150;
    let graph = graphs::binary_then_activations(
        LayerType::Sub,
        &[LayerType::Relu, LayerType::Sigmoid],
        &dims,
    );
    let a = random_values(1, count);
    let b = random_values(2, count);
    let expected: Vec<f32> = a
        .iter()
        .zip(&b)
        .map(|(&x, &y)| sigmoid((x - y).max(0.0)))
        .collect();

    let mut fused = h.build(&graph).unwrap();
    if h.supports(LayerType::FusedElementwise) {
        let layers = &fused.graph().unwrap().structure.layers;
        assert!(
            layers
                .iter()
                .any(|layer| layer.layer_type == LayerType::FusedElementwise),
            "expected a fused layer in {layers:?}"
        );
        assert!(layers.iter().all(|layer| layer.layer_type != LayerType::Relu));
    }
    let fused_out = run(&mut fused, &[("a", &a), ("b", &b)], "out").unwrap();
    assert_close(&fused_out, &expected, ACTIVATION_TOLERANCE);

    let mut plain = h
        .build_with(&no_fusion(h), &ModelConfig::default(), &graph)
        .unwrap();
    assert!(plain
        .graph()
        .unwrap()
        .structure
        .layers
        .iter()
        .all(|layer| layer.layer_type != LayerType::FusedElementwise));
    let plain_out = run(&mut plain, &[("a", &a), ("b", &b)], "out").unwrap();
    assert_close(&plain_out, &fused_out, ACTIVATION_TOLERANCE);
}

pub fn reshape_rebinds_blobs(h: &Harness) {
    let graph = graphs::binary_then_activations(LayerType::Add, &[LayerType::Relu], &[1, 2, 3, 3]);
    let mut network = h.build(&graph).unwrap();
    let expect = |a: &[f32], b: &[f32]| -> Vec<f32> {
        a.iter().zip(b).map(|(&x, &y)| (x + y).max(0.0)).collect()
    };

    let small_a = random_values(3, 18);
    let small_b = random_values(4, 18);
    let first = run(&mut network, &[("a", &small_a), ("b", &small_b)], "out").unwrap();
    assert_close(&first, &expect(&small_a, &small_b), TOLERANCE);

    let large: DimsVector = DimsVector::from_slice(&[2, 3, 5, 5]);
    let shapes = BTreeMap::from([
        ("a".to_string(), large.clone()),
        ("b".to_string(), large.clone()),
    ]);
    let supports_reshape = network
        .device_handle()
        .unwrap()
        .capabilities()
        .supports_reshape;
    if !supports_reshape {
        let err = network.reshape(&shapes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotSupported);
        return;
    }
    network.reshape(&shapes).unwrap();
    assert_eq!(network.state(), NetworkState::Ready);
    assert_eq!(network.get_all_output_blobs()["out"].dims(), large.as_slice());
    assert!(network.memory_plan().unwrap().conflicts().is_empty());

    let big_a = random_values(5, 150);
    let big_b = random_values(6, 150);
    let second = run(&mut network, &[("a", &big_a), ("b", &big_b)], "out").unwrap();
    assert_close(&second, &expect(&big_a, &big_b), TOLERANCE);

    let small: DimsVector = DimsVector::from_slice(&[1, 2, 3, 3]);
    let back = BTreeMap::from([("a".to_string(), small.clone()), ("b".to_string(), small)]);
    network.reshape(&back).unwrap();
    let third = run(&mut network, &[("a", &small_a), ("b", &small_b)], "out").unwrap();
    assert_eq!(first, third);

    let unknown = BTreeMap::from([("nope".to_string(), large)]);
    let err = network.reshape(&unknown).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    assert_eq!(network.state(), NetworkState::Ready);
}

pub fn forward_is_deterministic(h: &Harness) {
    let dims = [1, 4, 6, 6];
    let graph = graphs::binary_then_activations(
        LayerType::Mul,
        &[LayerType::Tanh, LayerType::Abs],
        &dims,
    );
    let a = random_values(7, 144);
    let b = random_values(8, 144);

    let mut first = h.build(&graph).unwrap();
    let one = run(&mut first, &[("a", &a), ("b", &b)], "out").unwrap();
    let two = run(&mut first, &[("a", &a), ("b", &b)], "out").unwrap();
    let mut second = h.build(&graph).unwrap();
    let three = run(&mut second, &[("a", &a), ("b", &b)], "out").unwrap();

    let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&one), bits(&two));
    assert_eq!(bits(&one), bits(&three));
}

pub fn memory_plan_is_sound(h: &Harness) {
    let ops = [
        LayerType::Relu,
        LayerType::Neg,
        LayerType::Abs,
        LayerType::Relu,
        LayerType::Neg,
        LayerType::Abs,
    ];
    let graph = graphs::activation_chain(&ops, &[1, 4, 8, 8]);
    let x = random_values(9, 256);
    let expected: Vec<f32> = x.iter().map(|v| v.max(0.0)).collect();

    let reuse = no_fusion(h);
    let mut shared = h.build_with(&reuse, &ModelConfig::default(), &graph).unwrap();
    let plan = shared.memory_plan().unwrap().clone();
    assert!(plan.conflicts().is_empty(), "{:?}", plan.conflicts());
    assert!(plan.forward_memory_size() <= plan.unshared_size());
    if std::env::var_os("NNRT_DISABLE_MEMORY_REUSE").is_none() {
        assert!(plan.forward_memory_size() < plan.unshared_size());
    }
    assert_eq!(
        shared.get_forward_memory_size().unwrap(),
        plan.forward_memory_size()
    );
    for name in ["x", "out"] {
        assert!(plan.slot_of(name).is_none(), "'{name}' must be dedicated");
    }
    let out = run(&mut shared, &[("x", &x)], "out").unwrap();
    assert_close(&out, &expected, TOLERANCE);

    let mut no_reuse = no_fusion(h);
    no_reuse.forward_memory_policy = ForwardMemoryPolicy::NoReuse;
    let mut separate = h
        .build_with(&no_reuse, &ModelConfig::default(), &graph)
        .unwrap();
    let plan = separate.memory_plan().unwrap();
    assert!(plan.conflicts().is_empty());
    assert_eq!(plan.forward_memory_size(), plan.unshared_size());
    assert!(plan.slots.iter().all(|slot| slot.tenants.len() == 1));
    let out = run(&mut separate, &[("x", &x)], "out").unwrap();
    assert_close(&out, &expected, TOLERANCE);
}

pub fn kernel_dispatch_is_exact(h: &Harness) {
    let registry = h.registry();
    let device = h.device_type();
    for layer_type in LayerType::ALL {
        match registry.kernel(layer_type, device) {
            Ok(kernel) => {
                assert!(registry.has_kernel(layer_type, device));
                assert_eq!(kernel.layer_type, layer_type);
                assert_eq!(kernel.device_type, device);
            }
            Err(err) => {
                assert!(!registry.has_kernel(layer_type, device));
                assert_eq!(err.kind(), ErrorKind::UnsupportedOperator);
            }
        }
    }
    let err = registry
        .kernel(LayerType::Add, nnrt::DeviceType::Custom(4242))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperator);

    let missing = [
        (LayerType::Softmax, graphs::softmax(&[1, 4], 1)),
        (LayerType::Concat, graphs::concat(&[1, 2], &[1, 3], 1)),
        (LayerType::MatMul, graphs::matmul(&[2, 3], &[3, 2])),
    ]
    .into_iter()
    .find(|(layer_type, _)| !h.supports(*layer_type));
    let Some((layer_type, graph)) = missing else {
        return;
    };
    let mut network = Network::new();
    let err = network
        .init(registry, &h.config(), &ModelConfig::default(), &graph, &BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperator, "{layer_type}: {err}");
    assert_eq!(network.state(), NetworkState::Deinitialized);
}

pub fn forward_async_calls_back_once(h: &Harness) {
    let dims = [1, 3, 4, 4];
    let mut network = h.build(&graphs::binary(LayerType::Maximum, &dims)).unwrap();
    let a = random_values(10, 48);
    let b = random_values(11, 48);
    write(&network, "a", &a).unwrap();
    write(&network, "b", &b).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let counter = Arc::clone(&calls);
    network
        .forward_async(move |result| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(result);
        })
        .unwrap();
    let result = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    result.unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let out = read_f32(&network, "out").unwrap();
    let expected: Vec<f32> = a.iter().zip(&b).map(|(&x, &y)| x.max(y)).collect();
    assert_close(&out, &expected, TOLERANCE);
}

pub fn external_forward_memory(h: &Harness) {
    let dims = [1, 3, 4, 4];
    let graph = graphs::binary_then_activations(
        LayerType::Add,
        &[LayerType::Relu, LayerType::Neg],
        &dims,
    );
    let mut config = no_fusion(h);
    config.forward_memory_policy = ForwardMemoryPolicy::SetFromExternal;
    let mut network = h.build_with(&config, &ModelConfig::default(), &graph).unwrap();
    assert_eq!(network.state(), NetworkState::Initialized);

    let err = network.forward().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let called = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&called);
    let err = network
        .forward_async(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(called.load(Ordering::SeqCst), 0);

    let size = network.get_forward_memory_size().unwrap();
    assert!(size > 0);
    let device = network.device_handle().unwrap().clone();
    if !device.capabilities().supports_external_forward_memory {
        let memory = device.allocate(size).unwrap();
        let err = network.set_forward_memory(memory).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceNotSupported);
        return;
    }

    let small = device.allocate(size - 1).unwrap();
    let err = network.set_forward_memory(small).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    assert_eq!(network.state(), NetworkState::Initialized);

    let memory = device.allocate(size).unwrap();
    network.set_forward_memory(memory).unwrap();
    assert_eq!(network.state(), NetworkState::Ready);

    let a = random_values(12, 48);
    let b = random_values(13, 48);
    let out = run(&mut network, &[("a", &a), ("b", &b)], "out").unwrap();
    let expected: Vec<f32> = a.iter().zip(&b).map(|(&x, &y)| -(x + y).max(0.0)).collect();
    assert_close(&out, &expected, TOLERANCE);
}

pub fn deinit_is_terminal(h: &Harness) {
    let graph = graphs::binary(LayerType::Add, &[1, 2, 2, 2]);
    let mut network = h.build(&graph).unwrap();
    network.deinit();
    assert_eq!(network.state(), NetworkState::Deinitialized);
    assert!(network.device_handle().is_none());
    assert!(network.get_all_output_blobs().is_empty());
    assert_eq!(network.forward().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(
        network.get_forward_memory_size().unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    let err = network
        .init(h.registry(), &h.config(), &ModelConfig::default(), &graph, &BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

pub fn invalid_device_id_leaves_network_uninitialized(h: &Harness) {
    let graph = graphs::binary(LayerType::Add, &[1, 2, 2, 2]);
    let mut config = h.config();
    config.device_id = 4096;
    let mut network = Network::new();
    let err = network
        .init(h.registry(), &config, &ModelConfig::default(), &graph, &BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert_eq!(network.state(), NetworkState::Uninitialized);
}
