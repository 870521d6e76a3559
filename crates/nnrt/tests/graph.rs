use nnrt::layer::param::{ConvParam, ElementwiseParam, GatherParam};
use nnrt::layer::resource::{ElementwiseResource, GatherResource};
use nnrt::layer::RawBuffer;
use nnrt::{DataType, ErrorKind, Graph, LayerInfo, LayerParam, LayerResource, LayerType, NetResource, NetStructure};

fn add(name: &str, inputs: &[&str], output: &str) -> LayerInfo {
    LayerInfo::new(
        LayerType::Add,
        name,
        inputs,
        &[output],
        LayerParam::Elementwise(ElementwiseParam::default()),
    )
}

fn relu(name: &str, input: &str, output: &str) -> LayerInfo {
    LayerInfo::new(LayerType::Relu, name, &[input], &[output], LayerParam::None)
}

fn structure(layers: Vec<LayerInfo>, outputs: &[&str]) -> NetStructure {
    let mut s = NetStructure::default();
    s.add_input("x", &[1, 4], DataType::Float32)
        .add_input("y", &[1, 4], DataType::Float32);
    for output in outputs {
        s.add_output(output);
    }
    for layer in layers {
        s.push_layer(layer);
    }
    s
}

fn graph_error(structure: NetStructure, resource: NetResource) -> String {
    let err = Graph::new(structure, resource).validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GraphError);
    err.message().to_string()
}

#[test]
fn well_formed_chain_validates() {
    let s = structure(
        vec![add("a", &["x", "y"], "t"), relu("r", "t", "out")],
        &["out"],
    );
    assert!(Graph::new(s.clone(), NetResource::default()).validate().is_ok());
    assert_eq!(s.producer_of("t"), Some(0));
    assert_eq!(s.consumers_of("t"), vec![1]);
    assert_eq!(s.blobs().len(), 4);
    assert_eq!(s.input_data_type("x"), DataType::Float32);
    assert_eq!(s.input_data_type("missing"), DataType::Float32);
}

#[test]
fn consuming_before_production_is_rejected() {
    let s = structure(
        vec![relu("r", "t", "out"), add("a", &["x", "y"], "t")],
        &["out"],
    );
    assert!(graph_error(s, NetResource::default()).contains("before its producer"));
}

#[test]
fn undefined_and_self_consumed_tensors_are_rejected() {
    let s = structure(vec![relu("r", "nowhere", "out")], &["out"]);
    assert!(graph_error(s, NetResource::default()).contains("undefined"));

    let s = structure(vec![add("a", &["x", "t"], "t")], &["t"]);
    assert!(graph_error(s, NetResource::default()).contains("its own output"));
}

#[test]
fn duplicate_producers_and_names_are_rejected() {
    let s = structure(
        vec![relu("r1", "x", "t"), relu("r2", "y", "t")],
        &["t"],
    );
    assert!(graph_error(s, NetResource::default()).contains("produced by both"));

    let s = structure(
        vec![relu("r", "x", "t"), relu("r", "t", "out")],
        &["out"],
    );
    assert!(graph_error(s, NetResource::default()).contains("duplicate layer name"));

    let s = structure(vec![relu("r", "y", "x")], &["x"]);
    assert!(graph_error(s, NetResource::default()).contains("overwrites graph input"));
}

#[test]
fn missing_outputs_and_persistent_tensors_are_rejected() {
    let s = structure(vec![relu("r", "x", "t")], &["out"]);
    assert!(graph_error(s, NetResource::default()).contains("never produced"));

    let mut s = structure(vec![relu("r", "x", "out")], &["out"]);
    s.persistent.insert("ghost".to_string());
    assert!(graph_error(s, NetResource::default()).contains("persistent"));
}

#[test]
fn params_arity_and_resources_must_match_kind() {
    let s = structure(
        vec![LayerInfo::new(
            LayerType::Relu,
            "r",
            &["x"],
            &["out"],
            LayerParam::Convolution(ConvParam::new(1, [1, 1])),
        )],
        &["out"],
    );
    assert!(graph_error(s, NetResource::default()).contains("parameters"));

    let s = structure(vec![add("a", &["x"], "out")], &["out"]);
    assert!(graph_error(s, NetResource::default()).contains("inputs"));

    let s = structure(
        vec![LayerInfo::new(
            LayerType::Convolution,
            "conv",
            &["x"],
            &["out"],
            LayerParam::Convolution(ConvParam::new(1, [1, 1])),
        )],
        &["out"],
    );
    assert!(graph_error(s, NetResource::default()).contains("no resource"));

    let s = structure(vec![relu("r", "x", "out")], &["out"]);
    let mut resource = NetResource::default();
    resource.insert(
        "r",
        LayerResource::Gather(GatherResource {
            data: None,
            indices: None,
            quant: None,
        }),
    );
    assert!(graph_error(s, resource).contains("gather resource"));
}

#[test]
fn constant_operand_takes_one_blob_input() {
    let layer = LayerInfo::new(
        LayerType::Mul,
        "scale",
        &["x"],
        &["out"],
        LayerParam::Elementwise(ElementwiseParam {
            constant_operand: Some(1),
        }),
    );
    let mut resource = NetResource::default();
    resource.insert(
        "scale",
        LayerResource::Elementwise(ElementwiseResource {
            constant: RawBuffer::scalar_f32(2.0),
            quant: None,
        }),
    );
    let graph = Graph::new(structure(vec![layer], &["out"]), resource);
    assert!(graph.validate().is_ok());
}

#[test]
fn gather_arity_follows_resource_operands() {
    let gather = |inputs: &[&str], data_in_resource| {
        LayerInfo::new(
            LayerType::Gather,
            "g",
            inputs,
            &["out"],
            LayerParam::Gather(GatherParam {
                axis: 0,
                data_in_resource,
                indices_in_resource: false,
            }),
        )
    };
    let mut resource = NetResource::default();
    resource.insert(
        "g",
        LayerResource::Gather(GatherResource {
            data: Some(RawBuffer::from_f32(&[2, 2], vec![0.0; 4]).unwrap()),
            indices: None,
            quant: None,
        }),
    );
    let ok = Graph::new(structure(vec![gather(&["x"], true)], &["out"]), resource.clone());
    assert!(ok.validate().is_ok());
    let s = structure(vec![gather(&["x", "y"], true)], &["out"]);
    assert!(graph_error(s, resource).contains("inputs"));
}
