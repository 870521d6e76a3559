use nnrt::{
    DataType, DeviceType, ErrorKind, ForwardMemoryPolicy, ModelConfig, NetworkConfig,
    QuantizationMode,
};

#[test]
fn network_config_parses_from_json() {
    let config = NetworkConfig::from_json_str(
        r#"{
            "device_type": "x86",
            "device_id": 1,
            "forward_memory_policy": "no_reuse",
            "disabled_optimizers": ["elementwise_fusion"]
        }"#,
    )
    .unwrap();
    assert_eq!(config.device_type, DeviceType::X86);
    assert_eq!(config.device_id, 1);
    assert_eq!(config.forward_memory_policy, ForwardMemoryPolicy::NoReuse);
    assert_eq!(config.disabled_optimizers, ["elementwise_fusion"]);
}

#[test]
fn missing_fields_take_defaults() {
    let config = NetworkConfig::from_json_str("{}").unwrap();
    assert_eq!(config, NetworkConfig::default());
    assert_eq!(config.device_type, DeviceType::Naive);
    assert_eq!(config.forward_memory_policy, ForwardMemoryPolicy::Reuse);

    let cuda = NetworkConfig::from_json_str(r#"{"device_type":"cuda"}"#).unwrap();
    assert_eq!(cuda, NetworkConfig::for_device(DeviceType::Cuda));
}

#[test]
fn external_memory_policy_is_never_overridden() {
    let config = NetworkConfig {
        forward_memory_policy: ForwardMemoryPolicy::SetFromExternal,
        ..NetworkConfig::default()
    };
    assert_eq!(
        config.effective_memory_policy(),
        ForwardMemoryPolicy::SetFromExternal
    );
}

#[test]
fn model_config_parses_shapes_and_quantization() {
    let model = ModelConfig::from_json_str(
        r#"{
            "input_shapes": {"tokens": [1, 16]},
            "input_data_types": {"tokens": "int32"},
            "quantization": "dynamic_range"
        }"#,
    )
    .unwrap();
    assert_eq!(model.input_shapes["tokens"].as_slice(), &[1, 16]);
    assert_eq!(model.input_data_types["tokens"], DataType::Int32);
    assert_eq!(model.quantization, QuantizationMode::DynamicRange);
    assert_eq!(ModelConfig::from_json_str("{}").unwrap(), ModelConfig::default());
}

#[test]
fn malformed_config_is_a_param_error() {
    for text in [
        "not json",
        r#"{"device_type":"tpu"}"#,
        r#"{"forward_memory_policy":"sometimes"}"#,
    ] {
        let err = NetworkConfig::from_json_str(text).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParamError, "{text}");
    }
    let err = ModelConfig::from_json_str(r#"{"quantization":"int4"}"#).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ParamError);
}
