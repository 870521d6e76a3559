//! Shared conformance scenarios for nnrt backends.
//!
//! Backend crates instantiate the suites from their `tests/` directory:
//!
//! ```ignore
//! nnrt_backend_tests::define_backend_tests!(naive_suite, || Some(harness()));
//! ```
//!
//! The constructor returns `None` when the device is unavailable on the
//! current machine; every generated test then returns early.

pub mod graphs;
pub mod harness;
pub mod operators;
pub mod smoke;

pub use harness::{init_test_logging, Harness};

/// Engine scenarios every backend must pass.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $harness_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use super::*;
            use $crate::smoke;
            use $crate::Harness;

            fn harness() -> Option<Harness> {
                ($harness_ctor)()
            }

            macro_rules! smoke_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let Some(h) = harness() else {
                            return;
                        };
                        smoke::$name(&h);
                    }
                };
            }

            smoke_test!(add_produces_expected_values);
            smoke_test!(fused_chain_matches_unfused);
            smoke_test!(reshape_rebinds_blobs);
            smoke_test!(forward_is_deterministic);
            smoke_test!(memory_plan_is_sound);
            smoke_test!(kernel_dispatch_is_exact);
            smoke_test!(forward_async_calls_back_once);
            smoke_test!(external_forward_memory);
            smoke_test!(deinit_is_terminal);
            smoke_test!(invalid_device_id_leaves_network_uninitialized);
        }
    };
}

/// Operator scenarios for host backends that implement the full operator
/// set.
#[macro_export]
macro_rules! define_host_operator_tests {
    ($module:ident, $harness_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use super::*;
            use $crate::operators;
            use $crate::Harness;

            fn harness() -> Harness {
                ($harness_ctor)()
            }

            macro_rules! operator_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        operators::$name(&harness());
                    }
                };
            }

            operator_test!(convolution_matches_reference);
            operator_test!(strided_grouped_convolution_matches_reference);
            operator_test!(dequantized_convolution_matches_float);
            operator_test!(inner_product_matches_reference);
            operator_test!(batched_matmul_matches_reference);
            operator_test!(softmax_normalizes_axis);
            operator_test!(concat_joins_channels);
            operator_test!(embedding_gathers_rows);
            operator_test!(division_with_partial_channel_block);
            operator_test!(convolution_feeds_elementwise);
        }
    };
}
