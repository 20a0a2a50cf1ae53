use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use super::noise::{NoisePlan, StepNoise};
use super::{RecurrentCell, default_rng, sigmoid, xavier};
use crate::{EncoderErr, Result, config::EncoderConfig};

/// One LSTM layer's parameters and accumulated gradients.
///
/// Gate columns are ordered (i, f, g, o), each `hidden` wide, so the joint
/// projections are `[in, 4*hidden]` and `[hidden, 4*hidden]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LstmLayer {
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    bias: Array1<f32>,

    #[serde(skip)]
    gw_ih: Array2<f32>,
    #[serde(skip)]
    gw_hh: Array2<f32>,
    #[serde(skip)]
    gbias: Array1<f32>,
}

impl LstmLayer {
    fn new(input_size: usize, hidden_size: usize, rng: &mut SmallRng) -> Self {
        Self {
            w_ih: xavier((input_size, 4 * hidden_size), rng),
            w_hh: xavier((hidden_size, 4 * hidden_size), rng),
            bias: Array1::zeros(4 * hidden_size),
            gw_ih: Array2::zeros((input_size, 4 * hidden_size)),
            gw_hh: Array2::zeros((hidden_size, 4 * hidden_size)),
            gbias: Array1::zeros(4 * hidden_size),
        }
    }

    /// Clears the gradient accumulators, resizing them after deserialization
    /// (serde skips them, leaving empty arrays).
    fn zero_grad(&mut self) {
        if self.gw_ih.dim() != self.w_ih.dim() {
            self.gw_ih = Array2::zeros(self.w_ih.dim());
            self.gw_hh = Array2::zeros(self.w_hh.dim());
            self.gbias = Array1::zeros(self.bias.dim());
        } else {
            self.gw_ih.fill(0.0);
            self.gw_hh.fill(0.0);
            self.gbias.fill(0.0);
        }
    }
}

/// Per-layer forward intermediates retained for the reverse-mode step.
#[derive(Clone, Debug)]
struct LstmLayerCache {
    /// The input actually fed to this layer (after dropout and residual).
    x: Array2<f32>,
    i: Array2<f32>,
    f: Array2<f32>,
    g: Array2<f32>,
    o: Array2<f32>,
    tanh_c: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct LstmCache {
    layers: Vec<LstmLayerCache>,
    noise: StepNoise,
}

/// A stack of LSTM layers acting as one recurrent cell.
///
/// State components are ordered `(c_1, h_1, ..., c_L, h_L)`; the last
/// component is the top layer's output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LstmStack {
    layers: Vec<LstmLayer>,
    input_size: usize,
    hidden_size: usize,
    residual: bool,
    noise: NoisePlan,

    #[serde(skip, default = "default_rng")]
    rng: SmallRng,
    #[serde(skip)]
    training: bool,
}

impl LstmStack {
    pub fn new(cfg: &EncoderConfig, input_size: usize, rng: &mut SmallRng) -> Result<Self> {
        cfg.validate()?;
        if input_size == 0 {
            return Err(EncoderErr::ZeroDim { what: "input size" });
        }

        let layers = (0..cfg.layers)
            .map(|l| {
                let in_size = if l == 0 { input_size } else { cfg.hidden_size };
                LstmLayer::new(in_size, cfg.hidden_size, rng)
            })
            .collect();

        Ok(Self {
            layers,
            input_size,
            hidden_size: cfg.hidden_size,
            residual: cfg.residual,
            noise: NoisePlan::new(
                cfg.dropout_mode,
                cfg.input_dropout,
                cfg.dropout,
                cfg.layers,
                input_size,
                cfg.hidden_size,
            )?,
            rng: default_rng(),
            training: false,
        })
    }

    pub fn noise(&self) -> &NoisePlan {
        &self.noise
    }

    fn check_step(
        &self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
        what: &'static str,
    ) -> Result<()> {
        if state.len() != 2 * self.layers.len() {
            return Err(EncoderErr::ArityMismatch {
                what,
                got: state.len(),
                expected: 2 * self.layers.len(),
            });
        }

        let batch = input.nrows();
        if input.ncols() != self.input_size {
            return Err(EncoderErr::ShapeMismatch {
                what: "step input features",
                got: vec![batch, input.ncols()],
                expected: vec![batch, self.input_size],
            });
        }
        for component in state {
            if component.dim() != (batch, self.hidden_size) {
                return Err(EncoderErr::ShapeMismatch {
                    what,
                    got: component.shape().to_vec(),
                    expected: vec![batch, self.hidden_size],
                });
            }
        }

        Ok(())
    }
}

impl RecurrentCell for LstmStack {
    type Cache = LstmCache;

    fn num_states(&self) -> usize {
        2 * self.layers.len()
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn begin_forward(&mut self, batch_size: usize, training: bool) -> Result<()> {
        self.training = training;
        self.noise.begin_forward(batch_size, training, &mut self.rng)
    }

    fn step(
        &mut self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
    ) -> Result<(Vec<Array2<f32>>, LstmCache)> {
        self.check_step(state, input, "state components")?;

        let l_count = self.layers.len();
        let h = self.hidden_size;
        let batch = input.nrows();
        let noise = self.noise.step_masks(batch, self.training, &mut self.rng)?;

        let mut next = Vec::with_capacity(2 * l_count);
        let mut caches = Vec::with_capacity(l_count);

        let mut x = input.to_owned();
        if let Some(mask) = &noise.input {
            x *= &**mask;
        }

        for (l, layer) in self.layers.iter().enumerate() {
            let c_prev = &state[2 * l];
            let h_prev = &state[2 * l + 1];

            let mut gates = x.dot(&layer.w_ih) + h_prev.dot(&layer.w_hh);
            gates += &layer.bias;

            let i = gates.slice(s![.., 0..h]).mapv(sigmoid);
            let f = gates.slice(s![.., h..2 * h]).mapv(sigmoid);
            let g = gates.slice(s![.., 2 * h..3 * h]).mapv(f32::tanh);
            let o = gates.slice(s![.., 3 * h..4 * h]).mapv(sigmoid);

            let c_new = &f * c_prev + &i * &g;
            let tanh_c = c_new.mapv(f32::tanh);
            let h_new = &o * &tanh_c;

            // Input for the layer above: dropped output, plus the skip
            // connection from this layer's own input when residual.
            let feed = if l + 1 < l_count {
                let mut nx = h_new.clone();
                if let Some(mask) = &noise.layers[l] {
                    nx *= &**mask;
                }
                if self.residual && l >= 1 {
                    nx += &x;
                }
                nx
            } else {
                Array2::zeros((0, 0))
            };

            let x_cached = std::mem::replace(&mut x, feed);
            caches.push(LstmLayerCache {
                x: x_cached,
                i,
                f,
                g,
                o,
                tanh_c,
            });
            next.push(c_new);
            next.push(h_new);
        }

        Ok((next, LstmCache {
            layers: caches,
            noise,
        }))
    }

    fn step_backward(
        &mut self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
        cache: &LstmCache,
        grad_next: &[Array2<f32>],
    ) -> Result<(Vec<Array2<f32>>, Array2<f32>)> {
        self.check_step(state, input, "state components")?;
        self.check_step(grad_next, input, "state gradients")?;
        if cache.layers.len() != self.layers.len() {
            return Err(EncoderErr::CacheMismatch);
        }

        let l_count = self.layers.len();
        let h = self.hidden_size;
        let batch = input.nrows();
        let residual = self.residual;

        let mut grad_state = vec![Array2::zeros((0, 0)); 2 * l_count];
        let mut d_input = Array2::zeros((batch, self.input_size));
        // Gradient flowing into the input of the layer above, if any.
        let mut dx_above: Option<Array2<f32>> = None;

        for l in (0..l_count).rev() {
            let layer = &mut self.layers[l];
            let lc = &cache.layers[l];
            let c_prev = &state[2 * l];
            let h_prev = &state[2 * l + 1];

            let mut dh = grad_next[2 * l + 1].clone();
            let dc_in = &grad_next[2 * l];

            if let Some(dx) = &dx_above {
                match &cache.noise.layers[l] {
                    Some(mask) => dh += &(dx * &**mask),
                    None => dh += dx,
                }
            }

            let do_ = &dh * &lc.tanh_c;
            let dc = &dh * &lc.o * &lc.tanh_c.mapv(|v| 1.0 - v * v) + dc_in;

            let di_raw = &dc * &lc.g * &lc.i.mapv(|v| v * (1.0 - v));
            let df_raw = &dc * c_prev * &lc.f.mapv(|v| v * (1.0 - v));
            let dg_raw = &dc * &lc.i * &lc.g.mapv(|v| 1.0 - v * v);
            let do_raw = &do_ * &lc.o.mapv(|v| v * (1.0 - v));

            let mut d_gates = Array2::zeros((batch, 4 * h));
            d_gates.slice_mut(s![.., 0..h]).assign(&di_raw);
            d_gates.slice_mut(s![.., h..2 * h]).assign(&df_raw);
            d_gates.slice_mut(s![.., 2 * h..3 * h]).assign(&dg_raw);
            d_gates.slice_mut(s![.., 3 * h..4 * h]).assign(&do_raw);

            layer.gw_ih += &lc.x.t().dot(&d_gates);
            layer.gw_hh += &h_prev.t().dot(&d_gates);
            layer.gbias += &d_gates.sum_axis(Axis(0));

            let mut dx = d_gates.dot(&layer.w_ih.t());
            grad_state[2 * l] = &dc * &lc.f;
            grad_state[2 * l + 1] = d_gates.dot(&layer.w_hh.t());

            // The skip connection forwards the layer-above gradient straight
            // into this layer's input gradient.
            if residual && l >= 1 {
                if let Some(above) = dx_above.take() {
                    dx += &above;
                }
            }

            if l == 0 {
                match &cache.noise.input {
                    Some(mask) => d_input = dx * &**mask,
                    None => d_input = dx,
                }
            } else {
                dx_above = Some(dx);
            }
        }

        Ok((grad_state, d_input))
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }
}
