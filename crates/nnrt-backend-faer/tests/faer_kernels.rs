use std::sync::Arc;

use nnrt::layer::param::{ConvParam, ElementwiseParam, LstmParam};
use nnrt::layer::resource::LstmResource;
use nnrt::layer::{KernelContext, LayerAcc, RawBuffer};
use nnrt::registry::RegistryBuilder;
use nnrt::{
    Blob, BlobDesc, DataFormat, DataType, DeviceHandle, DeviceType, ErrorKind, Graph, LayerInfo,
    LayerParam, LayerResource, LayerType, NetResource, NetStructure, NetworkState,
};
use nnrt_backend_faer::gemm_row_major;
use nnrt_backend_tests::graphs::{self, ConvWeights};
use nnrt_backend_tests::harness::{assert_close, random_values, run};
use nnrt_backend_naive::{host_capabilities, HostDevice};
use nnrt_backend_tests::Harness;

fn harness(device_type: DeviceType) -> Harness {
    let mut builder = RegistryBuilder::new();
    nnrt_backend_faer::register_faer_backend(&mut builder).unwrap();
    nnrt_backend_naive::register_naive_backend(&mut builder).unwrap();
    Harness::new(device_type, builder.build().unwrap())
}

#[test]
fn faer_backend_registers_both_host_devices() {
    let mut builder = RegistryBuilder::new();
    nnrt_backend_faer::register_faer_backend(&mut builder).unwrap();
    let registry = builder.build().unwrap();
    for device in [DeviceType::X86, DeviceType::Arm] {
        assert!(registry.has_device(device));
        assert!(registry.has_kernel(LayerType::Gather, device));
        assert!(!registry.has_kernel(LayerType::Lstm, device));
    }
}

#[test]
fn builtin_registry_collects_linked_host_backends() {
    let registry = nnrt::Registry::builtin().unwrap();
    for device in [DeviceType::Naive, DeviceType::X86, DeviceType::Arm] {
        assert!(registry.has_device(device), "{device} missing");
    }
}

#[test]
fn packed_division_skips_padding_lanes() {
    const SENTINEL: f32 = -12345.0;
    let harness = harness(DeviceType::X86);
    let registration = harness.registry().kernel(LayerType::Div, DeviceType::X86).unwrap();
    assert_eq!(registration.data_format, DataFormat::Nc4hw4);
    let device = DeviceHandle::open(
        Arc::new(HostDevice::new(
            DeviceType::X86,
            "x86-faer",
            host_capabilities(DataFormat::Nc4hw4),
        )),
        0,
    )
    .unwrap();

    // Three channels in one block of four: lane 3 of every position pads.
    let dims = [1, 3, 2, 2];
    let desc = |name: &str| {
        BlobDesc::new(name, DeviceType::X86, DataType::Float32, DataFormat::Nc4hw4, &dims)
    };
    let input_descs = [desc("a"), desc("b")];
    let output_descs = [desc("out")];
    let inputs: Vec<Blob> = input_descs
        .iter()
        .map(|d| Blob::allocate(d.clone(), &device).unwrap())
        .collect();
    let outputs = [Blob::allocate(output_descs[0].clone(), &device).unwrap()];
    assert_eq!(outputs[0].desc().storage_count(), 16);

    let is_padding = |p: usize| p % 4 == 3;
    let dividend: Vec<f32> = (0..16).map(|p| p as f32 + 1.0).collect();
    let divisor: Vec<f32> = (0..16).map(|p| if is_padding(p) { 0.0 } else { 2.0 }).collect();
    device.write_blob(&inputs[0], &dividend).unwrap();
    device.write_blob(&inputs[1], &divisor).unwrap();
    device.write_blob(&outputs[0], &[SENTINEL; 16]).unwrap();

    let layer = LayerInfo::new(
        LayerType::Div,
        "div",
        &["a", "b"],
        &["out"],
        LayerParam::Elementwise(ElementwiseParam::default()),
    );
    let promotion = registration
        .promotion
        .resolve(&[DataType::Float32, DataType::Float32])
        .unwrap();
    let cx = KernelContext {
        layer: &layer,
        resource: None,
        device: &device,
        promotion,
        inputs: &input_descs,
        outputs: &output_descs,
    };
    let mut kernel = (registration.create)(&cx).unwrap();
    kernel.forward(&device, &inputs, &outputs).unwrap();

    let out = device.read_blob::<f32>(&outputs[0]).unwrap();
    for (p, value) in out.iter().enumerate() {
        if is_padding(p) {
            assert_eq!(*value, SENTINEL, "padding lane {p} was written");
        } else {
            assert!(value.is_finite(), "lane {p} is {value}");
            assert_eq!(*value, dividend[p] / 2.0);
        }
    }
}

#[test]
fn gemm_row_major_matches_naive_product() {
    let (m, k, n) = (5, 7, 3);
    let a = random_values(1, m * k);
    let b = random_values(2, k * n);
    let mut out = vec![f32::NAN; m * n];
    gemm_row_major(&a, &b, &mut out, m, k, n);
    let mut expected = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            expected[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
        }
    }
    assert_close(&out, &expected, 1e-5);
}

#[test]
fn gemm_with_empty_depth_writes_zeros() {
    let mut out = vec![1.0f32; 6];
    gemm_row_major(&[], &[], &mut out, 2, 0, 3);
    assert_eq!(out, vec![0.0; 6]);
}

#[test]
fn convolution_runs_packed_with_layout_conversions() {
    let h = harness(DeviceType::X86);
    let mut param = ConvParam::new(6, [3, 3]);
    param.pads = [1, 1, 1, 1];
    let dims = [1, 3, 6, 6];
    let graph = graphs::convolution(
        param,
        &dims,
        ConvWeights::Float {
            filter: random_values(10, 6 * 3 * 9),
            bias: None,
        },
    );
    let network = h.build(&graph).unwrap();
    let optimized = network.graph().unwrap();
    let converts = optimized
        .structure
        .layers
        .iter()
        .filter(|layer| layer.layer_type == LayerType::LayoutConvert)
        .count();
    assert_eq!(converts, 2);
    assert_eq!(network.blob("out").unwrap().data_format(), DataFormat::Nchw);
}

#[test]
fn faer_and_naive_agree_on_convolution() {
    let mut param = ConvParam::new(7, [3, 2]);
    param.stride = [1, 2];
    param.pads = [1, 1, 0, 1];
    param.has_bias = true;
    let dims = [2, 5, 6, 7];
    let filter = random_values(20, 7 * 5 * 3 * 2);
    let bias = random_values(21, 7);
    let x = random_values(22, dims.iter().product());
    let graph = graphs::convolution(
        param,
        &dims,
        ConvWeights::Float {
            filter,
            bias: Some(bias),
        },
    );

    let mut outputs = Vec::new();
    for device_type in [DeviceType::X86, DeviceType::Naive] {
        let mut network = harness(device_type).build(&graph).unwrap();
        outputs.push(run(&mut network, &[("x", &x)], "out").unwrap());
    }
    assert_close(&outputs[0], &outputs[1], 1e-4);
}

#[test]
fn lstm_is_unsupported() {
    let h = harness(DeviceType::Arm);
    assert!(!h.supports(LayerType::Lstm));
    let mut structure = NetStructure::default();
    structure
        .add_input("x", &[1, 1, 2], DataType::Float32)
        .add_output("y")
        .push_layer(LayerInfo::new(
            LayerType::Lstm,
            "lstm",
            &["x"],
            &["y"],
            LayerParam::Lstm(LstmParam { hidden_size: 1 }),
        ));
    let mut resources = NetResource::default();
    resources.insert(
        "lstm",
        LayerResource::Lstm(LstmResource {
            w: RawBuffer::from_f32(&[4, 2], vec![0.1; 8]).unwrap(),
            r: RawBuffer::from_f32(&[4, 1], vec![0.1; 4]).unwrap(),
            bias: None,
            w_quant: None,
            r_quant: None,
        }),
    );
    let mut network = nnrt::Network::new();
    let err = network
        .init(
            h.registry(),
            &h.config(),
            &nnrt::ModelConfig::default(),
            &Graph::new(structure, resources),
            &Default::default(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperator);
    assert_eq!(network.state(), NetworkState::Deinitialized);
}
