use std::sync::Arc;

use nnrt::layer::cast::{PromotionRule, PromotionTable};
use nnrt::layer::{KernelContext, KernelRegistration, LayerAcc};
use nnrt::{DataFormat, DataType, DeviceType, ErrorKind, LayerType, RegistryBuilder, Status};
use nnrt_backend_naive::{host_capabilities, register_naive_backend, HostDevice};

static F32_ONLY: PromotionTable = PromotionTable {
    name: "test_f32",
    rules: &[PromotionRule::uniform(DataType::Float32, DataType::Float32, DataType::Float32)],
};

static OVERLAPPING: PromotionTable = PromotionTable {
    name: "test_overlapping",
    rules: &[
        PromotionRule::uniform(DataType::Float32, DataType::Float32, DataType::Float32),
        PromotionRule::exact(&[DataType::Float32, DataType::Float32], DataType::Float32, DataType::Float16),
    ],
};

static NARROWING: PromotionTable = PromotionTable {
    name: "test_narrowing",
    rules: &[PromotionRule::uniform(DataType::Int64, DataType::Int32, DataType::Int32)],
};

fn never(_cx: &KernelContext<'_>) -> nnrt::Result<Box<dyn LayerAcc>> {
    Err(Status::kernel("not instantiated in these tests"))
}

fn kernel(layer_type: LayerType, device_type: DeviceType, promotion: &'static PromotionTable) -> KernelRegistration {
    KernelRegistration {
        layer_type,
        device_type,
        data_format: DataFormat::Nchw,
        promotion,
        create: never,
    }
}

#[test]
fn duplicate_device_is_rejected() {
    let mut builder = RegistryBuilder::new();
    builder.register_device(Arc::new(HostDevice::naive())).unwrap();
    let err = builder
        .register_device(Arc::new(HostDevice::naive()))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
}

#[test]
fn duplicate_kernel_is_rejected() {
    let mut builder = RegistryBuilder::new();
    builder
        .register_kernel(kernel(LayerType::Add, DeviceType::Naive, &F32_ONLY))
        .unwrap();
    let err = builder
        .register_kernel(kernel(LayerType::Add, DeviceType::Naive, &F32_ONLY))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
}

#[test]
fn registering_a_backend_twice_fails() {
    let mut builder = RegistryBuilder::new();
    register_naive_backend(&mut builder).unwrap();
    let err = register_naive_backend(&mut builder).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateRegistration);
}

#[test]
fn ambiguous_and_narrowing_tables_are_rejected() {
    let mut builder = RegistryBuilder::new();
    let err = builder
        .register_kernel(kernel(LayerType::Add, DeviceType::Naive, &OVERLAPPING))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
    let err = builder
        .register_kernel(kernel(LayerType::Sub, DeviceType::Naive, &NARROWING))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::UnsupportedTypeCombination);
}

#[test]
fn kernel_for_unregistered_device_fails_build() {
    let mut builder = RegistryBuilder::new();
    builder.register_device(Arc::new(HostDevice::naive())).unwrap();
    builder
        .register_kernel(kernel(LayerType::Relu, DeviceType::Metal, &F32_ONLY))
        .unwrap();
    assert_eq!(builder.build().unwrap_err().kind(), ErrorKind::UnknownDevice);
}

#[test]
fn kernel_layout_must_be_held_by_device() {
    let mut caps = host_capabilities(DataFormat::Nchw);
    caps.data_formats = vec![DataFormat::Nchw];
    let mut builder = RegistryBuilder::new();
    builder
        .register_device(Arc::new(HostDevice::new(DeviceType::Custom(3), "plain", caps)))
        .unwrap();
    let mut packed = kernel(LayerType::Relu, DeviceType::Custom(3), &F32_ONLY);
    packed.data_format = DataFormat::Nc4hw4;
    builder.register_kernel(packed).unwrap();
    assert_eq!(builder.build().unwrap_err().kind(), ErrorKind::UnsupportedFormat);
}

#[test]
fn lookups_are_exact() {
    let mut builder = RegistryBuilder::new();
    register_naive_backend(&mut builder).unwrap();
    let registry = builder.build().unwrap();

    assert_eq!(registry.device_types(), [DeviceType::Naive]);
    assert_eq!(registry.device(DeviceType::Naive).unwrap().name(), "naive");
    assert_eq!(
        registry.device(DeviceType::X86).err().unwrap().kind(),
        ErrorKind::UnknownDevice
    );
    assert!(registry.kernel(LayerType::Add, DeviceType::Naive).is_ok());
    let err = registry.kernel(LayerType::Add, DeviceType::X86).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperator);
    let err = registry
        .kernel(LayerType::Add, DeviceType::Custom(9))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperator);
    assert_eq!(registry.kernels_for(DeviceType::Naive).count(), LayerType::ALL.len());
}
