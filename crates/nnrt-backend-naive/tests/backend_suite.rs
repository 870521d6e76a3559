use nnrt::registry::RegistryBuilder;
use nnrt::DeviceType;
use nnrt_backend_tests::Harness;

fn naive_harness() -> Harness {
    let mut builder = RegistryBuilder::new();
    nnrt_backend_naive::register_naive_backend(&mut builder).unwrap();
    Harness::new(DeviceType::Naive, builder.build().unwrap())
}

nnrt_backend_tests::define_backend_tests!(naive_smoke, || Some(naive_harness()));
nnrt_backend_tests::define_host_operator_tests!(naive_operators, naive_harness);
