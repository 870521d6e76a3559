use std::collections::BTreeMap;

use nnrt::layer::param::{ElementwiseParam, LstmParam};
use nnrt::layer::resource::{ElementwiseResource, LstmResource};
use nnrt::layer::RawBuffer;
use nnrt::registry::RegistryBuilder;
use nnrt::{
    Blob, BlobDesc, DataFormat, DataType, DeviceHandle, DeviceType, ErrorKind, Graph, LayerInfo,
    LayerParam, LayerResource, LayerType, ModelConfig, NetResource, NetStructure, Network,
    NetworkConfig, Registry,
};
use nnrt_backend_naive::{register_naive_backend, tables, HostDevice};
use nnrt_backend_tests::harness::{assert_close, read_f32, write};
use nnrt_backend_tests::init_test_logging;

fn registry() -> Registry {
    init_test_logging();
    let mut builder = RegistryBuilder::new();
    register_naive_backend(&mut builder).unwrap();
    builder.build().unwrap()
}

fn build(graph: &Graph) -> nnrt::Result<Network> {
    let mut network = Network::new();
    network.init(
        &registry(),
        &NetworkConfig::for_device(DeviceType::Naive),
        &ModelConfig::default(),
        graph,
        &BTreeMap::new(),
    )?;
    Ok(network)
}

fn binary_graph(layer_type: LayerType, a: DataType, b: DataType, dims: &[usize]) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("a", dims, a)
        .add_input("b", dims, b)
        .add_output("out")
        .push_layer(LayerInfo::new(
            layer_type,
            "op",
            &["a", "b"],
            &["out"],
            LayerParam::Elementwise(ElementwiseParam::default()),
        ));
    Graph::new(structure, NetResource::default())
}

fn read_i32(network: &Network, name: &str) -> Vec<i32> {
    let device = network.device_handle().unwrap();
    device.read_blob::<i32>(network.blob(name).unwrap()).unwrap()
}

#[test]
fn builtin_registry_links_naive_backend() {
    let registry = Registry::builtin().unwrap();
    assert!(registry.has_device(DeviceType::Naive));
    for layer_type in LayerType::ALL {
        assert!(
            registry.has_kernel(layer_type, DeviceType::Naive),
            "naive backend lacks {layer_type}"
        );
    }
}

#[test]
fn host_tables_validate_and_register() {
    for table in [
        &tables::BINARY,
        &tables::FLOAT,
        &tables::FUSED,
        &tables::MOVE,
        &tables::GATHER,
    ] {
        table.validate().unwrap_or_else(|err| panic!("{}: {err}", table.name));
    }
    let mut builder = RegistryBuilder::new();
    register_naive_backend(&mut builder).unwrap();
    let registry = builder.build().unwrap();
    assert_eq!(registry.kernels_for(DeviceType::Naive).count(), LayerType::ALL.len());
}

#[test]
fn integer_arithmetic_stays_integer() {
    let mut network = build(&binary_graph(LayerType::Mod, DataType::Int32, DataType::Int32, &[4])).unwrap();
    assert_eq!(network.blob("out").unwrap().data_type(), DataType::Int32);
    write(&network, "a", &[7i32, -7, 9, i32::MIN]).unwrap();
    write(&network, "b", &[3i32, 3, -4, -1]).unwrap();
    network.forward().unwrap();
    assert_eq!(read_i32(&network, "out"), [1, -1, 1, 0]);
}

#[test]
fn integer_division_by_zero_is_kernel_error() {
    let mut network = build(&binary_graph(LayerType::Div, DataType::Int32, DataType::Int32, &[3])).unwrap();
    write(&network, "a", &[6i32, 4, 2]).unwrap();
    write(&network, "b", &[3i32, 0, 1]).unwrap();
    let err = network.forward().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KernelError);
}

#[test]
fn float_remainder_is_truncated() {
    let mut network = build(&binary_graph(LayerType::Mod, DataType::Float32, DataType::Float32, &[3])).unwrap();
    write(&network, "a", &[-7.5f32, 7.5, 5.0]).unwrap();
    write(&network, "b", &[2.0f32, -2.0, 2.5]).unwrap();
    network.forward().unwrap();
    assert_eq!(read_f32(&network, "out").unwrap(), [-1.5, 1.5, 0.0]);
}

#[test]
fn mixed_float_and_int_operands_promote_to_float() {
    let mut network = build(&binary_graph(LayerType::Mul, DataType::Float32, DataType::Int32, &[2, 2])).unwrap();
    assert_eq!(network.blob("out").unwrap().data_type(), DataType::Float32);
    write(&network, "a", &[0.5f32, -1.5, 2.0, 0.25]).unwrap();
    write(&network, "b", &[2i32, 2, -3, 8]).unwrap();
    network.forward().unwrap();
    assert_eq!(read_f32(&network, "out").unwrap(), [1.0, -3.0, -6.0, 2.0]);
}

#[test]
fn int8_operands_have_no_promotion_rule() {
    let err = build(&binary_graph(LayerType::Add, DataType::Int8, DataType::Int8, &[4])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
}

#[test]
fn constant_operand_broadcasts_over_channels() {
    let dims = [1, 3, 2, 2];
    let mut structure = NetStructure::default();
    structure
        .add_input("x", &dims, DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Sub,
            "shift",
            &["x"],
            &["out"],
            LayerParam::Elementwise(ElementwiseParam {
                constant_operand: Some(0),
            }),
        ));
    let mut resources = NetResource::default();
    resources.insert(
        "shift",
        LayerResource::Elementwise(ElementwiseResource {
            constant: RawBuffer::from_f32(&[1, 3, 1, 1], vec![10.0, 20.0, 30.0]).unwrap(),
            quant: None,
        }),
    );
    let mut network = build(&Graph::new(structure, resources)).unwrap();
    let x: Vec<f32> = (0..12).map(|v| v as f32).collect();
    write(&network, "x", &x).unwrap();
    network.forward().unwrap();
    let expected: Vec<f32> = x
        .iter()
        .enumerate()
        .map(|(i, v)| [10.0, 20.0, 30.0][i / 4] - v)
        .collect();
    assert_eq!(read_f32(&network, "out").unwrap(), expected);
}

fn scalar_constant_graph(layer_type: LayerType, input: DataType, constant: f32) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("x", &[4], input)
        .add_output("out")
        .push_layer(LayerInfo::new(
            layer_type,
            "scalar",
            &["x"],
            &["out"],
            LayerParam::Elementwise(ElementwiseParam {
                constant_operand: Some(1),
            }),
        ));
    let mut resources = NetResource::default();
    resources.insert(
        "scalar",
        LayerResource::Elementwise(ElementwiseResource {
            constant: RawBuffer::from_f32(&[1], vec![constant]).unwrap(),
            quant: None,
        }),
    );
    Graph::new(structure, resources)
}

#[test]
fn float_constant_promotes_integer_input() {
    let mut network = build(&scalar_constant_graph(LayerType::Mod, DataType::Int32, 2.5)).unwrap();
    assert_eq!(network.blob("out").unwrap().data_type(), DataType::Float32);
    write(&network, "x", &[7i32, -7, 5, 1]).unwrap();
    network.forward().unwrap();
    assert_eq!(read_f32(&network, "out").unwrap(), [2.0, -2.0, 0.0, 1.0]);
}

#[test]
fn float_constant_widens_half_input() {
    let mut network = build(&scalar_constant_graph(LayerType::Add, DataType::Float16, 0.25)).unwrap();
    assert_eq!(network.blob("out").unwrap().data_type(), DataType::Float32);
    // 1.0, -0.5, 2.0, 3.0 as binary16 bit patterns.
    write(&network, "x", &[0x3C00u16, 0xB800, 0x4000, 0x4200]).unwrap();
    network.forward().unwrap();
    assert_eq!(read_f32(&network, "out").unwrap(), [1.25, -0.25, 2.25, 3.25]);
}

fn lstm_graph(hidden: usize, features: usize, seq: usize, batch: usize, resource: LstmResource) -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("x", &[seq, batch, features], DataType::Float32)
        .add_output("y")
        .add_output("h")
        .add_output("c")
        .push_layer(LayerInfo::new(
            LayerType::Lstm,
            "lstm",
            &["x"],
            &["y", "h", "c"],
            LayerParam::Lstm(LstmParam { hidden_size: hidden }),
        ));
    let mut resources = NetResource::default();
    resources.insert("lstm", LayerResource::Lstm(resource));
    Graph::new(structure, resources)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[test]
fn lstm_single_unit_matches_hand_computation() {
    // Gate rows: input, output, forget, cell.
    let w = vec![0.5, -0.25, 0.75, 1.0];
    let r = vec![0.1, 0.2, -0.3, 0.4];
    let bias = vec![0.05, 0.0, 0.1, -0.1, 0.05, 0.0, -0.1, 0.2];
    let resource = LstmResource {
        w: RawBuffer::from_f32(&[4, 1], w.clone()).unwrap(),
        r: RawBuffer::from_f32(&[4, 1], r.clone()).unwrap(),
        bias: Some(RawBuffer::from_f32(&[8], bias.clone()).unwrap()),
        w_quant: None,
        r_quant: None,
    };
    let mut network = build(&lstm_graph(1, 1, 3, 1, resource)).unwrap();
    let xs = [1.0f32, -0.5, 2.0];
    write(&network, "x", &xs).unwrap();
    network.forward().unwrap();

    let (mut h, mut c) = (0.0f32, 0.0f32);
    let mut ys = Vec::new();
    for x in xs {
        let gate = |g: usize| w[g] * x + r[g] * h + bias[g] + bias[4 + g];
        let (i, o, f, cell) = (sigmoid(gate(0)), sigmoid(gate(1)), sigmoid(gate(2)), gate(3).tanh());
        c = f * c + i * cell;
        h = o * c.tanh();
        ys.push(h);
    }
    assert_close(&read_f32(&network, "y").unwrap(), &ys, 1e-6);
    assert_close(&read_f32(&network, "h").unwrap(), &[h], 1e-6);
    assert_close(&read_f32(&network, "c").unwrap(), &[c], 1e-6);
}

#[test]
fn lstm_rejects_mismatched_weights() {
    let resource = LstmResource {
        w: RawBuffer::from_f32(&[8, 3], vec![0.0; 24]).unwrap(),
        r: RawBuffer::from_f32(&[8, 2], vec![0.0; 16]).unwrap(),
        bias: None,
        w_quant: None,
        r_quant: None,
    };
    let mut network = Network::new();
    let err = network
        .init(
            &registry(),
            &NetworkConfig::for_device(DeviceType::Naive),
            &ModelConfig::default(),
            &lstm_graph(2, 4, 1, 1, resource),
            &BTreeMap::new(),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShapeInferenceError);
    assert_eq!(network.state(), nnrt::NetworkState::Deinitialized);
}

fn naive_handle() -> DeviceHandle {
    init_test_logging();
    DeviceHandle::open(std::sync::Arc::new(HostDevice::naive()), 0).unwrap()
}

#[test]
fn packed_layout_round_trips_partial_channel_block() {
    let handle = naive_handle();
    let dims = [1, 5, 1, 2];
    let desc = BlobDesc::new("x", DeviceType::Naive, DataType::Float32, DataFormat::Nchw, &dims);
    let blob = Blob::allocate(desc, &handle).unwrap();
    let values: Vec<f32> = (0..10).map(|v| v as f32).collect();
    handle.write_blob(&blob, &values).unwrap();

    let packed = handle.convert_layout(&blob, DataFormat::Nc4hw4).unwrap();
    assert_eq!(packed.desc().storage_count(), 16);
    let raw = handle.read_blob::<f32>(&packed).unwrap();
    // Channel c, spatial s lives at ((c / 4) * 2 + s) * 4 + c % 4.
    assert_eq!(&raw[..8], &[0.0, 2.0, 4.0, 6.0, 1.0, 3.0, 5.0, 7.0]);
    assert_eq!((raw[8], raw[12]), (8.0, 9.0));

    let back = handle.convert_layout(&packed, DataFormat::Nchw).unwrap();
    assert_eq!(handle.read_blob::<f32>(&back).unwrap(), values);
}

#[test]
fn nhwc_conversion_interleaves_channels() {
    let handle = naive_handle();
    let dims = [1, 2, 1, 3];
    let desc = BlobDesc::new("x", DeviceType::Naive, DataType::Int32, DataFormat::Nchw, &dims);
    let blob = Blob::allocate(desc, &handle).unwrap();
    handle.write_blob(&blob, &[1i32, 2, 3, 10, 20, 30]).unwrap();
    let nhwc = handle.convert_layout(&blob, DataFormat::Nhwc).unwrap();
    assert_eq!(handle.read_blob::<i32>(&nhwc).unwrap(), [1, 10, 2, 20, 3, 30]);
}

#[test]
fn opaque_layout_has_no_host_converter() {
    let handle = naive_handle();
    let desc = BlobDesc::new("x", DeviceType::Naive, DataType::Float32, DataFormat::Nchw, &[1, 4]);
    let blob = Blob::allocate(desc, &handle).unwrap();
    let err = handle.convert_layout(&blob, DataFormat::Opaque).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}
