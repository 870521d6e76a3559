//! Single-direction LSTM.
//!
//! Gate blocks in `W`, `R` and both bias halves are ordered input, output,
//! forget, cell. Inputs are `x [seq, batch, features]` plus optional
//! initial `h` and `c` of shape `[batch, hidden]`; outputs are the hidden
//! sequence and the final `h` and `c`, each optional past the first.

use nnrt::layer::{KernelContext, LayerAcc};
use nnrt::{Blob, DeviceHandle, LayerParam, LayerResource, Result, Status};

use super::{raw_to_f32, unexpected_param};
use crate::host;

struct LstmKernel {
    hidden: usize,
    w: Vec<f32>,
    r: Vec<f32>,
    /// `Wb + Rb`, `[4 * hidden]`.
    bias: Vec<f32>,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl LstmKernel {
    fn new(cx: &KernelContext<'_>) -> Result<Self> {
        let LayerParam::Lstm(param) = &cx.layer.param else {
            return Err(unexpected_param(cx.layer));
        };
        let Some(LayerResource::Lstm(resource)) = cx.resource.map(|r| r.as_ref()) else {
            return Err(Status::param(format!("lstm '{}' has no weights", cx.layer.name)));
        };
        if resource.w_quant.is_some()
            || resource.r_quant.is_some()
            || resource.w.is_quantized_storage()
            || resource.r.is_quantized_storage()
        {
            return Err(Status::kernel(format!(
                "lstm '{}' still holds quantized weights",
                cx.layer.name
            )));
        }
        let hidden = param.hidden_size;
        let bias = match &resource.bias {
            Some(raw) => {
                let b = raw_to_f32(raw)?;
                if b.len() != 8 * hidden {
                    return Err(Status::param(format!(
                        "lstm '{}' bias has {} values, expected {}",
                        cx.layer.name,
                        b.len(),
                        8 * hidden
                    )));
                }
                (0..4 * hidden).map(|i| b[i] + b[4 * hidden + i]).collect()
            }
            None => vec![0.0; 4 * hidden],
        };
        Ok(LstmKernel {
            hidden,
            w: raw_to_f32(&resource.w)?,
            r: raw_to_f32(&resource.r)?,
            bias,
        })
    }
}

impl LayerAcc for LstmKernel {
    fn forward(&mut self, _device: &DeviceHandle, inputs: &[Blob], outputs: &[Blob]) -> Result<()> {
        let x_blob = inputs
            .first()
            .ok_or_else(|| Status::kernel("lstm has no input"))?;
        let [seq, batch, features] = *x_blob.dims() else {
            return Err(Status::kernel(format!(
                "lstm input must be rank 3, got {:?}",
                x_blob.dims()
            )));
        };
        let hidden = self.hidden;
        if self.w.len() != 4 * hidden * features {
            return Err(Status::kernel(format!(
                "lstm W holds {} values, input has {features} features",
                self.w.len()
            )));
        }
        let x = host::read_f32(x_blob)?;
        let mut h = match inputs.get(1) {
            Some(blob) => host::read_f32(blob)?,
            None => vec![0.0; batch * hidden],
        };
        let mut c = match inputs.get(2) {
            Some(blob) => host::read_f32(blob)?,
            None => vec![0.0; batch * hidden],
        };
        if h.len() != batch * hidden || c.len() != batch * hidden {
            return Err(Status::kernel("lstm initial state does not match [batch, hidden]"));
        }

        let mut y = vec![0.0f32; seq * batch * hidden];
        let mut gates = vec![0.0f32; 4 * hidden];
        for t in 0..seq {
            for b in 0..batch {
                let xt = &x[(t * batch + b) * features..(t * batch + b + 1) * features];
                let hb = &h[b * hidden..(b + 1) * hidden];
                for (g, gate) in gates.iter_mut().enumerate() {
                    let wx: f32 = self.w[g * features..(g + 1) * features]
                        .iter()
                        .zip(xt)
                        .map(|(w, v)| w * v)
                        .sum();
                    let rh: f32 = self.r[g * hidden..(g + 1) * hidden]
                        .iter()
                        .zip(hb)
                        .map(|(r, v)| r * v)
                        .sum();
                    *gate = wx + rh + self.bias[g];
                }
                for j in 0..hidden {
                    let i_gate = sigmoid(gates[j]);
                    let o_gate = sigmoid(gates[hidden + j]);
                    let f_gate = sigmoid(gates[2 * hidden + j]);
                    let cell = gates[3 * hidden + j].tanh();
                    let cj = f_gate * c[b * hidden + j] + i_gate * cell;
                    c[b * hidden + j] = cj;
                    let hj = o_gate * cj.tanh();
                    y[(t * batch + b) * hidden + j] = hj;
                    h[b * hidden + j] = hj;
                }
            }
        }

        let mut results = [y, h, c].into_iter();
        for output in outputs {
            let values = results
                .next()
                .ok_or_else(|| Status::kernel("lstm has at most three outputs"))?;
            host::write_f32(output, &values)?;
        }
        Ok(())
    }
}

pub fn create_lstm(cx: &KernelContext<'_>) -> Result<Box<dyn LayerAcc>> {
    Ok(Box::new(LstmKernel::new(cx)?))
}
