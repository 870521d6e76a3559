//! Operator scenarios for host backends, checked against straightforward
//! reference loops.

use nnrt::layer::param::ConvParam;
use nnrt::{DataType, LayerInfo, LayerParam, LayerResource, LayerType, ModelConfig, QuantizationMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::graphs::{self, ConvWeights};
use crate::harness::{assert_close, random_values, read_f32, run, write, Harness};

const TOLERANCE: f32 = 1e-4;

/// Direct NCHW convolution.
pub fn conv_reference(
    param: &ConvParam,
    dims: &[usize],
    input: &[f32],
    filter: &[f32],
    bias: Option<&[f32]>,
) -> Vec<f32> {
    let (n, c, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let [kh, kw] = param.kernel;
    let [sh, sw] = param.stride;
    let [dh, dw] = param.dilation;
    let [pt, pb, pl, pr] = param.pads;
    let out_h = (h + pt + pb - dh * (kh - 1) - 1) / sh + 1;
    let out_w = (w + pl + pr - dw * (kw - 1) - 1) / sw + 1;
    let oc = param.output_channels;
    let icg = c / param.group;
    let ocg = oc / param.group;

    let mut out = vec![0.0f32; n * oc * out_h * out_w];
    for b in 0..n {
        for o in 0..oc {
            let group = o / ocg;
            for y in 0..out_h {
                for x in 0..out_w {
                    let mut acc = bias.map_or(0.0, |bias| bias[o]);
                    for ci in 0..icg {
                        let ic = group * icg + ci;
                        for ky in 0..kh {
                            let iy = (y * sh + ky * dh) as isize - pt as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (x * sw + kx * dw) as isize - pl as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let (iy, ix) = (iy as usize, ix as usize);
                                acc += input[((b * c + ic) * h + iy) * w + ix]
                                    * filter[((o * icg + ci) * kh + ky) * kw + kx];
                            }
                        }
                    }
                    out[((b * oc + o) * out_h + y) * out_w + x] = acc;
                }
            }
        }
    }
    out
}

fn check_convolution(h: &Harness, param: ConvParam, dims: &[usize], seed: u64) {
    let icg = dims[1] / param.group;
    let filter_len = param.output_channels * icg * param.kernel[0] * param.kernel[1];
    let input = random_values(seed, dims.iter().product());
    let filter = random_values(seed + 1, filter_len);
    let bias = param
        .has_bias
        .then(|| random_values(seed + 2, param.output_channels));
    let expected = conv_reference(&param, dims, &input, &filter, bias.as_deref());

    let graph = graphs::convolution(param, dims, ConvWeights::Float { filter, bias });
    let mut network = h.build(&graph).unwrap();
    let out = run(&mut network, &[("x", &input)], "out").unwrap();
    assert_close(&out, &expected, TOLERANCE);
}

pub fn convolution_matches_reference(h: &Harness) {
    let mut param = ConvParam::new(8, [3, 3]);
    param.pads = [1, 1, 1, 1];
    param.has_bias = true;
    check_convolution(h, param, &[1, 3, 7, 7], 20);
}

pub fn strided_grouped_convolution_matches_reference(h: &Harness) {
    let mut param = ConvParam::new(6, [3, 3]);
    param.stride = [2, 1];
    param.dilation = [1, 2];
    param.pads = [1, 0, 2, 1];
    param.group = 2;
    check_convolution(h, param, &[2, 4, 9, 8], 30);
}

pub fn dequantized_convolution_matches_float(h: &Harness) {
    let mut param = ConvParam::new(4, [3, 3]);
    param.pads = [1, 1, 1, 1];
    param.has_bias = true;
    let dims = [1, 2, 6, 6];
    let filter_len = 4 * 2 * 9;
    let mut rng = StdRng::seed_from_u64(40);
    let quantized: Vec<i8> = (0..filter_len).map(|_| rng.gen_range(-127i8..=127)).collect();
    let scales: Vec<f32> = (0..4).map(|o| 0.01 * (o + 1) as f32).collect();
    let per_channel = filter_len / 4;
    let dequantized: Vec<f32> = quantized
        .iter()
        .enumerate()
        .map(|(i, &q)| q as f32 * scales[i / per_channel])
        .collect();
    let bias = random_values(41, 4);
    let input = random_values(42, 72);

    let model = ModelConfig {
        quantization: QuantizationMode::DynamicRange,
        ..ModelConfig::default()
    };
    let int8_graph = graphs::convolution(
        param,
        &dims,
        ConvWeights::Int8 {
            filter: quantized,
            scales,
            bias: Some(bias.clone()),
        },
    );
    let mut int8 = h.build_with(&h.config(), &model, &int8_graph).unwrap();
    let rewritten = int8.graph().unwrap().resource.get("conv").unwrap();
    assert!(!rewritten.is_quantized());
    let LayerResource::Convolution(conv) = rewritten.as_ref() else {
        panic!("convolution resource expected, got {}", rewritten.kind_name());
    };
    assert_close(conv.filter.as_f32().unwrap(), &dequantized, 1e-6);
    let int8_out = run(&mut int8, &[("x", &input)], "out").unwrap();

    let float_graph = graphs::convolution(
        param,
        &dims,
        ConvWeights::Float {
            filter: dequantized.clone(),
            bias: Some(bias.clone()),
        },
    );
    let mut float = h.build(&float_graph).unwrap();
    let float_out = run(&mut float, &[("x", &input)], "out").unwrap();

    assert_close(&int8_out, &float_out, 1e-6);
    let expected = conv_reference(&param, &dims, &input, &dequantized, Some(&bias));
    assert_close(&int8_out, &expected, TOLERANCE);
}

pub fn inner_product_matches_reference(h: &Harness) {
    let dims = [2, 3, 2, 2];
    let (batch, depth, num_output) = (2, 12, 5);
    let x = random_values(50, batch * depth);
    let weight = random_values(51, num_output * depth);
    let bias = random_values(52, num_output);
    let mut expected = Vec::with_capacity(batch * num_output);
    for b in 0..batch {
        for o in 0..num_output {
            let dot: f32 = (0..depth)
                .map(|k| x[b * depth + k] * weight[o * depth + k])
                .sum();
            expected.push(dot + bias[o]);
        }
    }

    let graph = graphs::inner_product(&dims, num_output, weight, bias);
    let mut network = h.build(&graph).unwrap();
    assert_eq!(network.get_all_output_blobs()["out"].dims(), &[2, 5]);
    let out = run(&mut network, &[("x", &x)], "out").unwrap();
    assert_close(&out, &expected, TOLERANCE);
}

pub fn batched_matmul_matches_reference(h: &Harness) {
    let (batch, m, k, n) = (2, 3, 4, 5);
    let a = random_values(60, batch * m * k);
    let b = random_values(61, batch * k * n);
    let mut expected = vec![0.0f32; batch * m * n];
    for bi in 0..batch {
        for i in 0..m {
            for j in 0..n {
                expected[(bi * m + i) * n + j] = (0..k)
                    .map(|p| a[(bi * m + i) * k + p] * b[(bi * k + p) * n + j])
                    .sum();
            }
        }
    }

    let mut network = h.build(&graphs::matmul(&[batch, m, k], &[batch, k, n])).unwrap();
    let out = run(&mut network, &[("a", &a), ("b", &b)], "out").unwrap();
    assert_close(&out, &expected, TOLERANCE);
}

pub fn softmax_normalizes_axis(h: &Harness) {
    let dims = [2, 3, 4];
    let x: Vec<f32> = random_values(70, 24).iter().map(|v| v * 10.0).collect();
    let mut network = h.build(&graphs::softmax(&dims, 1)).unwrap();
    let out = run(&mut network, &[("x", &x)], "out").unwrap();

    let mut expected = vec![0.0f32; 24];
    for outer in 0..2 {
        for inner in 0..4 {
            let at = |c: usize| (outer * 3 + c) * 4 + inner;
            let max = (0..3).map(|c| x[at(c)]).fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = (0..3).map(|c| (x[at(c)] - max).exp()).sum();
            for c in 0..3 {
                expected[at(c)] = (x[at(c)] - max).exp() / sum;
            }
        }
    }
    assert_close(&out, &expected, TOLERANCE);
}

pub fn concat_joins_channels(h: &Harness) {
    let a = random_values(80, 18);
    let b = random_values(81, 27);
    let mut network = h.build(&graphs::concat(&[1, 2, 3, 3], &[1, 3, 3, 3], -3)).unwrap();
    assert_eq!(network.get_all_output_blobs()["out"].dims(), &[1, 5, 3, 3]);
    let out = run(&mut network, &[("a", &a), ("b", &b)], "out").unwrap();
    let expected: Vec<f32> = a.iter().chain(&b).copied().collect();
    assert_eq!(out, expected);
}

pub fn embedding_gathers_rows(h: &Harness) {
    let (rows, width) = (6, 4);
    let table = random_values(90, rows * width);
    let ids: [i32; 4] = [2, 0, 5, -1];
    let mut network = h.build(&graphs::embedding(rows, width, table.clone(), ids.len())).unwrap();
    write(&network, "ids", &ids).unwrap();
    network.forward().unwrap();
    let out = read_f32(&network, "out").unwrap();

    let expected: Vec<f32> = ids
        .iter()
        .flat_map(|&id| {
            let row = if id < 0 { rows as i32 + id } else { id } as usize;
            table[row * width..(row + 1) * width].to_vec()
        })
        .collect();
    assert_eq!(out, expected);
}

/// Channel counts that are not a multiple of the packing width leave
/// padding lanes in packed layouts; division must not read them.
pub fn division_with_partial_channel_block(h: &Harness) {
    let dims = [2, 3, 3, 2];
    let a = random_values(100, 36);
    let b: Vec<f32> = random_values(101, 36)
        .iter()
        .map(|v| if *v >= 0.0 { v + 0.5 } else { v - 0.5 })
        .collect();
    let mut network = h.build(&graphs::binary(LayerType::Div, &dims)).unwrap();
    let out = run(&mut network, &[("a", &a), ("b", &b)], "out").unwrap();
    assert!(out.iter().all(|v| v.is_finite()));
    let expected: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x / y).collect();
    assert_close(&out, &expected, 1e-5);
}

/// conv -> relu -> add with a second graph input, so packed kernels and
/// layout conversions meet plain inputs.
pub fn convolution_feeds_elementwise(h: &Harness) {
    let mut param = ConvParam::new(5, [3, 3]);
    param.pads = [1, 1, 1, 1];
    let dims = [1, 3, 5, 5];
    let x = random_values(110, 75);
    let y = random_values(111, 125);
    let filter = random_values(112, 5 * 3 * 9);

    let mut graph = graphs::convolution(
        param,
        &dims,
        ConvWeights::Float {
            filter: filter.clone(),
            bias: None,
        },
    );
    let structure = &mut graph.structure;
    structure.outputs.clear();
    structure.layers[0].outputs = vec!["c".to_string()];
    structure
        .add_input("y", &[1, 5, 5, 5], DataType::Float32)
        .add_output("out")
        .push_layer(LayerInfo::new(
            LayerType::Relu,
            "relu",
            &["c"],
            &["r"],
            LayerParam::None,
        ))
        .push_layer(LayerInfo::new(
            LayerType::Add,
            "add",
            &["r", "y"],
            &["out"],
            graphs::elementwise_param(LayerType::Add),
        ));

    let conv = conv_reference(&param, &dims, &x, &filter, None);
    let expected: Vec<f32> = conv.iter().zip(&y).map(|(c, y)| c.max(0.0) + y).collect();
    let mut network = h.build(&graph).unwrap();
    let out = run(&mut network, &[("x", &x), ("y", &y)], "out").unwrap();
    assert_close(&out, &expected, TOLERANCE);
}
