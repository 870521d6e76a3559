use nnrt::registry::RegistryBuilder;
use nnrt::{DeviceType, Registry};
use nnrt_backend_tests::Harness;

fn faer_registry() -> Registry {
    let mut builder = RegistryBuilder::new();
    nnrt_backend_faer::register_faer_backend(&mut builder).unwrap();
    builder.build().unwrap()
}

fn x86_harness() -> Harness {
    Harness::new(DeviceType::X86, faer_registry())
}

fn arm_harness() -> Harness {
    Harness::new(DeviceType::Arm, faer_registry())
}

nnrt_backend_tests::define_backend_tests!(x86_smoke, || Some(x86_harness()));
nnrt_backend_tests::define_host_operator_tests!(x86_operators, x86_harness);

nnrt_backend_tests::define_backend_tests!(arm_smoke, || Some(arm_harness()));
