use std::collections::BTreeMap;

use anyhow::{anyhow, Context as _, Result};
use nnrt::{DeviceType, Graph, LayerType, ModelConfig, Network, NetworkConfig, Registry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Installs a `RUST_LOG`-filtered subscriber writing through the test
/// harness. Later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A registry plus the device every scenario targets.
pub struct Harness {
    registry: Registry,
    device_type: DeviceType,
}

impl Harness {
    pub fn new(device_type: DeviceType, registry: Registry) -> Self {
        init_test_logging();
        Harness {
            registry,
            device_type,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn supports(&self, layer_type: LayerType) -> bool {
        self.registry.has_kernel(layer_type, self.device_type)
    }

    pub fn config(&self) -> NetworkConfig {
        NetworkConfig::for_device(self.device_type)
    }

    pub fn build(&self, graph: &Graph) -> Result<Network> {
        self.build_with(&self.config(), &ModelConfig::default(), graph)
    }

    pub fn build_with(
        &self,
        config: &NetworkConfig,
        model: &ModelConfig,
        graph: &Graph,
    ) -> Result<Network> {
        let mut network = Network::new();
        network
            .init(&self.registry, config, model, graph, &BTreeMap::new())
            .with_context(|| format!("init on {}", self.device_type))?;
        Ok(network)
    }
}

/// Uploads `values` into the blob called `name`.
pub fn write<T: bytemuck::Pod>(network: &Network, name: &str, values: &[T]) -> Result<()> {
    let device = network
        .device_handle()
        .ok_or_else(|| anyhow!("network has no open device"))?;
    let blob = network
        .blob(name)
        .ok_or_else(|| anyhow!("network has no blob '{name}'"))?;
    device
        .write_blob(blob, values)
        .with_context(|| format!("upload '{name}'"))?;
    Ok(())
}

pub fn read_f32(network: &Network, name: &str) -> Result<Vec<f32>> {
    let device = network
        .device_handle()
        .ok_or_else(|| anyhow!("network has no open device"))?;
    let blob = network
        .blob(name)
        .ok_or_else(|| anyhow!("network has no blob '{name}'"))?;
    Ok(device
        .read_blob::<f32>(blob)
        .with_context(|| format!("download '{name}'"))?)
}

/// Uploads every input, runs one forward pass and downloads `output`.
pub fn run(network: &mut Network, inputs: &[(&str, &[f32])], output: &str) -> Result<Vec<f32>> {
    for (name, values) in inputs {
        write(network, name, values)?;
    }
    network.forward().context("forward")?;
    read_f32(network, output)
}

/// Uniform values in `[-1, 1)`.
pub fn random_values(seed: u64, count: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Asserts `|a - e| <= tolerance * max(1, |e|)` element by element.
pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        actual.len(),
        expected.len()
    );
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let bound = tolerance * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= bound,
            "element {i}: got {a}, expected {e} (tolerance {bound})"
        );
    }
}
