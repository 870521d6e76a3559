use std::sync::Arc;

use nnrt::layer::param::{ConvParam, ElementwiseParam};
use nnrt::layer::resource::{ConvResource, ElementwiseResource};
use nnrt::layer::{KernelRegistration, QuantParams, RawBuffer};
use nnrt::optimizer::{
    dequantize, DynamicRangeDequantPass, ElementwiseFusionPass, LayoutInsertionPass, NetOptimizer,
    OptimizeContext, OptimizerPipeline, PassResult,
};
use nnrt::{
    DataFormat, DataType, DeviceType, ErrorKind, Graph, LayerInfo, LayerParam, LayerResource,
    LayerType, ModelConfig, NetResource, NetStructure, NetworkConfig, Registry, RegistryBuilder,
};
use nnrt_backend_naive::kernels::{elementwise, reference_registrations};
use nnrt_backend_naive::{host_capabilities, register_naive_backend, tables, HostDevice};

const PACKED: DeviceType = DeviceType::Custom(40);
const INT8_NATIVE: DeviceType = DeviceType::Custom(41);

fn naive_registry() -> Registry {
    let mut builder = RegistryBuilder::new();
    register_naive_backend(&mut builder).unwrap();
    builder.build().unwrap()
}

/// A host device whose `Relu` kernel runs in the packed layout.
fn packed_registry() -> Registry {
    let mut builder = RegistryBuilder::new();
    builder
        .register_device(Arc::new(HostDevice::new(
            PACKED,
            "packed",
            host_capabilities(DataFormat::Nc4hw4),
        )))
        .unwrap();
    builder
        .register_kernels(&reference_registrations(PACKED, &[LayerType::Relu]))
        .unwrap();
    builder
        .register_kernel(KernelRegistration {
            layer_type: LayerType::Relu,
            device_type: PACKED,
            data_format: DataFormat::Nc4hw4,
            promotion: &tables::FLOAT,
            create: elementwise::create_unary,
        })
        .unwrap();
    builder.build().unwrap()
}

fn int8_native_registry() -> Registry {
    let mut caps = host_capabilities(DataFormat::Nchw);
    caps.native_int8_weights = true;
    let mut builder = RegistryBuilder::new();
    builder
        .register_device(Arc::new(HostDevice::new(INT8_NATIVE, "int8", caps)))
        .unwrap();
    builder
        .register_kernels(&reference_registrations(INT8_NATIVE, &[]))
        .unwrap();
    builder.build().unwrap()
}

fn binary(layer_type: LayerType, name: &str, inputs: &[&str], output: &str) -> LayerInfo {
    LayerInfo::new(
        layer_type,
        name,
        inputs,
        &[output],
        LayerParam::Elementwise(ElementwiseParam::default()),
    )
}

fn unary(layer_type: LayerType, name: &str, input: &str, output: &str) -> LayerInfo {
    LayerInfo::new(layer_type, name, &[input], &[output], LayerParam::None)
}

fn graph(inputs: &[(&str, DataType)], outputs: &[&str], layers: Vec<LayerInfo>) -> Graph {
    let mut structure = NetStructure::default();
    for (name, data_type) in inputs {
        structure.add_input(name, &[1, 6, 2, 2], *data_type);
    }
    for output in outputs {
        structure.add_output(output);
    }
    for layer in layers {
        structure.push_layer(layer);
    }
    Graph::new(structure, NetResource::default())
}

fn f32_inputs() -> [(&'static str, DataType); 2] {
    [("a", DataType::Float32), ("b", DataType::Float32)]
}

fn run_pass(
    pass: &dyn NetOptimizer,
    graph: &mut Graph,
    registry: &Registry,
    device: DeviceType,
) -> PassResult {
    let config = NetworkConfig::for_device(device);
    let model = ModelConfig::default();
    let cx = OptimizeContext::new(registry, &config, &model);
    assert!(pass.is_supported(&cx), "{} unsupported on {device}", pass.strategy());
    pass.optimize(graph, &cx).unwrap()
}

#[test]
fn default_pipeline_order() {
    assert_eq!(
        OptimizerPipeline::default_order().strategies(),
        ["dynamic_range_dequant", "elementwise_fusion", "layout_insertion"]
    );
}

#[test]
fn fusion_merges_single_consumer_activation_chain() {
    let registry = naive_registry();
    let mut g = graph(
        &f32_inputs(),
        &["out"],
        vec![
            binary(LayerType::Add, "add", &["a", "b"], "t0"),
            unary(LayerType::Relu, "relu", "t0", "t1"),
            unary(LayerType::Sigmoid, "sigmoid", "t1", "out"),
        ],
    );
    let stats = run_pass(&ElementwiseFusionPass, &mut g, &registry, DeviceType::Naive);
    assert!(stats.changed);
    assert_eq!((stats.rewrites_applied, stats.erased), (1, 2));

    let layers = &g.structure.layers;
    assert_eq!(layers.len(), 1);
    let fused = &layers[0];
    assert_eq!(fused.layer_type, LayerType::FusedElementwise);
    assert_eq!(fused.name, "add");
    assert_eq!(fused.inputs, ["a", "b"]);
    assert_eq!(fused.outputs, ["out"]);
    let LayerParam::FusedElementwise(param) = &fused.param else {
        panic!("fused layer has {:?}", fused.param.kind());
    };
    assert_eq!(param.head, LayerType::Add);
    assert_eq!(param.tail, [LayerType::Relu, LayerType::Sigmoid]);
    assert_eq!(param.fused_layers, ["add", "relu", "sigmoid"]);
    assert!(g.validate().is_ok());

    let before = g.clone();
    let again = run_pass(&ElementwiseFusionPass, &mut g, &registry, DeviceType::Naive);
    assert!(!again.changed);
    assert_eq!(g, before);
}

#[test]
fn fusion_stops_at_shared_and_declared_tensors() {
    let registry = naive_registry();
    // t0 feeds two layers, t1 is a declared output.
    let mut g = graph(
        &f32_inputs(),
        &["t1", "out", "side"],
        vec![
            binary(LayerType::Mul, "mul", &["a", "b"], "t0"),
            unary(LayerType::Abs, "abs", "t0", "side"),
            unary(LayerType::Relu, "relu", "t0", "t1"),
            unary(LayerType::Tanh, "tanh", "t1", "out"),
        ],
    );
    let before = g.clone();
    let stats = run_pass(&ElementwiseFusionPass, &mut g, &registry, DeviceType::Naive);
    assert!(!stats.changed);
    assert_eq!(g, before);
}

#[test]
fn fusion_skips_integer_compute() {
    let registry = naive_registry();
    let mut g = graph(
        &[("a", DataType::Int32), ("b", DataType::Int32)],
        &["out"],
        vec![
            binary(LayerType::Add, "add", &["a", "b"], "t0"),
            binary(LayerType::Mul, "mul", &["t0", "b"], "out"),
        ],
    );
    let before = g.clone();
    run_pass(&ElementwiseFusionPass, &mut g, &registry, DeviceType::Naive);
    assert_eq!(g, before);
}

#[test]
fn fusion_extends_an_existing_fused_head() {
    let registry = naive_registry();
    let mut g = graph(
        &f32_inputs(),
        &["out"],
        vec![
            binary(LayerType::Sub, "sub", &["a", "b"], "t0"),
            unary(LayerType::Abs, "abs", "t0", "t1"),
            unary(LayerType::Neg, "neg", "t1", "out"),
        ],
    );
    // Fuse the first pair only by declaring the middle tensor persistent.
    g.structure.persistent.insert("t1".to_string());
    run_pass(&ElementwiseFusionPass, &mut g, &registry, DeviceType::Naive);
    assert_eq!(g.structure.layers.len(), 2);

    g.structure.persistent.clear();
    run_pass(&ElementwiseFusionPass, &mut g, &registry, DeviceType::Naive);
    let LayerParam::FusedElementwise(param) = &g.structure.layers[0].param else {
        panic!("expected a fused layer");
    };
    assert_eq!(param.tail, [LayerType::Abs, LayerType::Neg]);
    assert_eq!(g.structure.layers.len(), 1);
}

#[test]
fn layout_pass_converts_once_per_tensor_and_format() {
    let registry = packed_registry();
    let mut g = graph(
        &[("a", DataType::Float32)],
        &["out", "out2"],
        vec![
            unary(LayerType::Relu, "relu", "a", "t"),
            unary(LayerType::Abs, "abs", "t", "out"),
            unary(LayerType::Neg, "neg", "t", "out2"),
        ],
    );
    let stats = run_pass(&LayoutInsertionPass, &mut g, &registry, PACKED);
    assert_eq!(stats.inserted, 2);

    let names: Vec<&str> = g.structure.layers.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(
        names,
        ["layout_convert/a@nc4hw4", "relu", "layout_convert/t@nchw", "abs", "neg"]
    );
    assert_eq!(g.structure.layers[1].inputs, ["a@nc4hw4"]);
    assert_eq!(g.structure.layers[3].inputs, ["t@nchw"]);
    assert_eq!(g.structure.layers[4].inputs, ["t@nchw"]);
    assert!(g.validate().is_ok());

    let before = g.clone();
    let again = run_pass(&LayoutInsertionPass, &mut g, &registry, PACKED);
    assert!(!again.changed);
    assert_eq!(g, before);
}

#[test]
fn layout_pass_restores_declared_output_names() {
    let registry = packed_registry();
    let mut g = graph(
        &[("a", DataType::Float32)],
        &["out"],
        vec![unary(LayerType::Relu, "relu", "a", "out")],
    );
    run_pass(&LayoutInsertionPass, &mut g, &registry, PACKED);
    let layers = &g.structure.layers;
    assert_eq!(layers.len(), 3);
    assert_eq!(layers[1].outputs, ["out@nc4hw4"]);
    assert_eq!(layers[2].inputs, ["out@nc4hw4"]);
    assert_eq!(layers[2].outputs, ["out"]);
    let LayerParam::LayoutConvert(param) = &layers[2].param else {
        panic!("expected a layout conversion");
    };
    assert_eq!((param.src_format, param.dst_format), (DataFormat::Nc4hw4, DataFormat::Nchw));
}

#[test]
fn layout_pass_is_skipped_when_every_kernel_is_nchw() {
    let registry = naive_registry();
    let config = NetworkConfig::for_device(DeviceType::Naive);
    let model = ModelConfig::default();
    let cx = OptimizeContext::new(&registry, &config, &model);
    assert!(!LayoutInsertionPass.is_supported(&cx));
}

fn quantized_conv_graph() -> Graph {
    let mut structure = NetStructure::default();
    structure
        .add_input("x", &[1, 1, 3, 3], DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Convolution,
            "conv",
            &["x"],
            &["out"],
            LayerParam::Convolution(ConvParam::new(2, [1, 1])),
        ));
    let mut resource = NetResource::default();
    resource.insert(
        "conv",
        LayerResource::Convolution(ConvResource {
            filter: RawBuffer::from_i8(&[2, 1, 1, 1], vec![-4, 10]).unwrap(),
            bias: None,
            quant: Some(QuantParams::per_channel(vec![0.5, 0.25], Some(vec![0, 2]), 0).unwrap()),
        }),
    );
    Graph::new(structure, resource)
}

#[test]
fn dequant_rewrites_int8_weights() {
    let registry = naive_registry();
    let mut g = quantized_conv_graph();
    let original = g.clone();
    let stats = run_pass(&DynamicRangeDequantPass, &mut g, &registry, DeviceType::Naive);
    assert_eq!(stats.rewrites_applied, 1);

    let resource = g.resource.get("conv").unwrap();
    assert!(!resource.is_quantized());
    let LayerResource::Convolution(conv) = &**resource else {
        panic!("expected a convolution resource");
    };
    assert_eq!(conv.filter.as_f32().unwrap(), &[-2.0, 2.0]);
    assert!(original.resource.get("conv").unwrap().is_quantized());

    let again = run_pass(&DynamicRangeDequantPass, &mut g, &registry, DeviceType::Naive);
    assert!(!again.changed);
}

#[test]
fn dequant_flags_quantized_elementwise_constants() {
    let registry = naive_registry();
    let mut structure = NetStructure::default();
    structure
        .add_input("x", &[4], DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Mul,
            "scale",
            &["x"],
            &["out"],
            LayerParam::Elementwise(ElementwiseParam {
                constant_operand: Some(1),
            }),
        ));
    let mut resource = NetResource::default();
    resource.insert(
        "scale",
        LayerResource::Elementwise(ElementwiseResource {
            constant: RawBuffer::from_i8(&[1], vec![3]).unwrap(),
            quant: Some(QuantParams::per_tensor(0.5, None)),
        }),
    );
    let mut g = Graph::new(structure, resource);
    let stats = run_pass(&DynamicRangeDequantPass, &mut g, &registry, DeviceType::Naive);
    assert!(!stats.changed);
    assert_eq!(stats.flagged, ["scale"]);
}

#[test]
fn dequant_is_skipped_for_native_int8_devices() {
    let registry = int8_native_registry();
    let config = NetworkConfig::for_device(INT8_NATIVE);
    let model = ModelConfig::default();
    let cx = OptimizeContext::new(&registry, &config, &model);
    assert!(!DynamicRangeDequantPass.is_supported(&cx));
    let out = OptimizerPipeline::default_order()
        .run(&quantized_conv_graph(), &cx)
        .unwrap();
    assert!(out.resource.get("conv").unwrap().is_quantized());
}

#[test]
fn dequantize_applies_zero_points_per_slice() {
    let weight = RawBuffer::from_i8(&[2, 3], vec![-128, 0, 127, 1, 2, 3]).unwrap();
    let per_tensor = dequantize(&weight, Some(&QuantParams::per_tensor(0.5, Some(1)))).unwrap();
    assert_eq!(per_tensor.as_f32().unwrap(), &[-64.5, -0.5, 63.0, 0.0, 0.5, 1.0]);

    let per_row = QuantParams::per_channel(vec![1.0, 2.0], Some(vec![0, 1]), 0).unwrap();
    let out = dequantize(&weight, Some(&per_row)).unwrap();
    assert_eq!(out.as_f32().unwrap(), &[-128.0, 0.0, 127.0, 0.0, 2.0, 4.0]);

    let wrong_axis = QuantParams::per_channel(vec![1.0, 2.0], None, 1).unwrap();
    let err = dequantize(&weight, Some(&wrong_axis)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
    let err = dequantize(&weight, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
}

#[test]
fn pipeline_honors_disabled_passes() {
    let registry = naive_registry();
    let mut config = NetworkConfig::for_device(DeviceType::Naive);
    config.disabled_optimizers = vec!["elementwise_fusion".to_string()];
    let model = ModelConfig::default();
    let cx = OptimizeContext::new(&registry, &config, &model);
    let g = graph(
        &f32_inputs(),
        &["out"],
        vec![
            binary(LayerType::Add, "add", &["a", "b"], "t0"),
            unary(LayerType::Relu, "relu", "t0", "out"),
        ],
    );
    let out = OptimizerPipeline::default_order().run(&g, &cx).unwrap();
    assert_eq!(out, g);
}
