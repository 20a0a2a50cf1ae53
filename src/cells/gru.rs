use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use super::noise::{NoisePlan, StepNoise};
use super::{RecurrentCell, default_rng, sigmoid, xavier};
use crate::{EncoderErr, Result, config::EncoderConfig};

/// One GRU layer's parameters and accumulated gradients.
///
/// Gate columns are ordered (z, r, n), each `hidden` wide. The reset gate is
/// applied to the recurrent candidate projection after the matmul:
/// `n = tanh(gx_n + r ⊙ gh_n)` with `gh = h W_hh + b_hh`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct GruLayer {
    w_ih: Array2<f32>,
    w_hh: Array2<f32>,
    b_ih: Array1<f32>,
    b_hh: Array1<f32>,

    #[serde(skip)]
    gw_ih: Array2<f32>,
    #[serde(skip)]
    gw_hh: Array2<f32>,
    #[serde(skip)]
    gb_ih: Array1<f32>,
    #[serde(skip)]
    gb_hh: Array1<f32>,
}

impl GruLayer {
    fn new(input_size: usize, hidden_size: usize, rng: &mut SmallRng) -> Self {
        Self {
            w_ih: xavier((input_size, 3 * hidden_size), rng),
            w_hh: xavier((hidden_size, 3 * hidden_size), rng),
            b_ih: Array1::zeros(3 * hidden_size),
            b_hh: Array1::zeros(3 * hidden_size),
            gw_ih: Array2::zeros((input_size, 3 * hidden_size)),
            gw_hh: Array2::zeros((hidden_size, 3 * hidden_size)),
            gb_ih: Array1::zeros(3 * hidden_size),
            gb_hh: Array1::zeros(3 * hidden_size),
        }
    }

    fn zero_grad(&mut self) {
        if self.gw_ih.dim() != self.w_ih.dim() {
            self.gw_ih = Array2::zeros(self.w_ih.dim());
            self.gw_hh = Array2::zeros(self.w_hh.dim());
            self.gb_ih = Array1::zeros(self.b_ih.dim());
            self.gb_hh = Array1::zeros(self.b_hh.dim());
        } else {
            self.gw_ih.fill(0.0);
            self.gw_hh.fill(0.0);
            self.gb_ih.fill(0.0);
            self.gb_hh.fill(0.0);
        }
    }
}

#[derive(Clone, Debug)]
struct GruLayerCache {
    /// The input actually fed to this layer (after dropout and residual).
    x: Array2<f32>,
    z: Array2<f32>,
    r: Array2<f32>,
    n: Array2<f32>,
    /// The recurrent candidate projection `h_prev W_hh[n] + b_hh[n]`, needed
    /// to route gradient through the reset gate.
    gh_n: Array2<f32>,
}

#[derive(Clone, Debug)]
pub struct GruCache {
    layers: Vec<GruLayerCache>,
    noise: StepNoise,
}

/// A stack of GRU layers acting as one recurrent cell.
///
/// One state component per layer, `(h_1, ..., h_L)`; the last component is
/// the top layer's output. `h' = (1 - z) ⊙ n + z ⊙ h`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GruStack {
    layers: Vec<GruLayer>,
    input_size: usize,
    hidden_size: usize,
    residual: bool,
    noise: NoisePlan,

    #[serde(skip, default = "default_rng")]
    rng: SmallRng,
    #[serde(skip)]
    training: bool,
}

impl GruStack {
    pub fn new(cfg: &EncoderConfig, input_size: usize, rng: &mut SmallRng) -> Result<Self> {
        cfg.validate()?;
        if input_size == 0 {
            return Err(EncoderErr::ZeroDim { what: "input size" });
        }

        let layers = (0..cfg.layers)
            .map(|l| {
                let in_size = if l == 0 { input_size } else { cfg.hidden_size };
                GruLayer::new(in_size, cfg.hidden_size, rng)
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
        if state.len() != self.layers.len() {
            return Err(EncoderErr::ArityMismatch {
                what,
                got: state.len(),
                expected: self.layers.len(),
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

impl RecurrentCell for GruStack {
    type Cache = GruCache;

    fn num_states(&self) -> usize {
        self.layers.len()
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
    ) -> Result<(Vec<Array2<f32>>, GruCache)> {
        self.check_step(state, input, "state components")?;

        let l_count = self.layers.len();
        let h = self.hidden_size;
        let batch = input.nrows();
        let noise = self.noise.step_masks(batch, self.training, &mut self.rng)?;

        let mut next = Vec::with_capacity(l_count);
        let mut caches = Vec::with_capacity(l_count);

        let mut x = input.to_owned();
        if let Some(mask) = &noise.input {
            x *= &**mask;
        }

        for (l, layer) in self.layers.iter().enumerate() {
            let h_prev = &state[l];

            let mut gx = x.dot(&layer.w_ih);
            gx += &layer.b_ih;
            let mut gh = h_prev.dot(&layer.w_hh);
            gh += &layer.b_hh;

            let z = (&gx.slice(s![.., 0..h]) + &gh.slice(s![.., 0..h])).mapv(sigmoid);
            let r = (&gx.slice(s![.., h..2 * h]) + &gh.slice(s![.., h..2 * h])).mapv(sigmoid);
            let gh_n = gh.slice(s![.., 2 * h..3 * h]).to_owned();
            let n = (&gx.slice(s![.., 2 * h..3 * h]) + &(&r * &gh_n)).mapv(f32::tanh);

            let h_new = &z.mapv(|v| 1.0 - v) * &n + &z * h_prev;

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
            caches.push(GruLayerCache {
                x: x_cached,
                z,
                r,
                n,
                gh_n,
            });
            next.push(h_new);
        }

        Ok((next, GruCache {
            layers: caches,
            noise,
        }))
    }

    fn step_backward(
        &mut self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
        cache: &GruCache,
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

        let mut grad_state = vec![Array2::zeros((0, 0)); l_count];
        let mut d_input = Array2::zeros((batch, self.input_size));
        let mut dx_above: Option<Array2<f32>> = None;

        for l in (0..l_count).rev() {
            let layer = &mut self.layers[l];
            let lc = &cache.layers[l];
            let h_prev = &state[l];

            let mut dh = grad_next[l].clone();
            if let Some(dx) = &dx_above {
                match &cache.noise.layers[l] {
                    Some(mask) => dh += &(dx * &**mask),
                    None => dh += dx,
                }
            }

            // h' = (1 - z) ⊙ n + z ⊙ h
            let dz = &dh * &(h_prev - &lc.n);
            let dn = &dh * &lc.z.mapv(|v| 1.0 - v);
            let mut dh_prev = &dh * &lc.z;

            let dn_raw = &dn * &lc.n.mapv(|v| 1.0 - v * v);
            let dr = &dn_raw * &lc.gh_n;
            let dgh_n = &dn_raw * &lc.r;

            let dz_raw = &dz * &lc.z.mapv(|v| v * (1.0 - v));
            let dr_raw = &dr * &lc.r.mapv(|v| v * (1.0 - v));

            let mut d_gates_x = Array2::zeros((batch, 3 * h));
            d_gates_x.slice_mut(s![.., 0..h]).assign(&dz_raw);
            d_gates_x.slice_mut(s![.., h..2 * h]).assign(&dr_raw);
            d_gates_x.slice_mut(s![.., 2 * h..3 * h]).assign(&dn_raw);

            let mut d_gates_h = Array2::zeros((batch, 3 * h));
            d_gates_h.slice_mut(s![.., 0..h]).assign(&dz_raw);
            d_gates_h.slice_mut(s![.., h..2 * h]).assign(&dr_raw);
            d_gates_h.slice_mut(s![.., 2 * h..3 * h]).assign(&dgh_n);

            layer.gw_ih += &lc.x.t().dot(&d_gates_x);
            layer.gw_hh += &h_prev.t().dot(&d_gates_h);
            layer.gb_ih += &d_gates_x.sum_axis(Axis(0));
            layer.gb_hh += &d_gates_h.sum_axis(Axis(0));

            let mut dx = d_gates_x.dot(&layer.w_ih.t());
            dh_prev += &d_gates_h.dot(&layer.w_hh.t());
            grad_state[l] = dh_prev;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CellType;
    use rand::SeedableRng;

    fn stack(layers: usize, input: usize, hidden: usize, residual: bool) -> GruStack {
        let mut cfg = EncoderConfig::new(layers, hidden, CellType::Gru);
        cfg.residual = residual;
        let mut rng = SmallRng::seed_from_u64(42);
        GruStack::new(&cfg, input, &mut rng).unwrap()
    }

    #[test]
    fn single_layer_still_returns_a_state_vector() {
        let mut cell = stack(1, 3, 4, false);
        cell.begin_forward(2, false).unwrap();

        let state = vec![Array2::zeros((2, 4))];
        let input = Array2::from_elem((2, 3), 0.5);
        let (next, _) = cell.step(&state, input.view()).unwrap();

        assert_eq!(next.len(), 1);
        assert_eq!(next[0].dim(), (2, 4));
    }

    #[test]
    fn saturated_update_gate_keeps_the_previous_state() {
        // With a strongly positive update-gate bias, z ≈ 1 and the step
        // copies h_prev through nearly unchanged.
        let mut cell = stack(1, 2, 3, false);
        cell.begin_forward(1, false).unwrap();

        let state = vec![Array2::from_elem((1, 3), 0.7)];
        let input = Array2::from_elem((1, 2), 0.1);

        cell.layers[0].b_ih.slice_mut(s![0..3]).fill(50.0);
        let (kept, _) = cell.step(&state, input.view()).unwrap();
        for (a, b) in kept[0].iter().zip(state[0].iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn gradients_match_finite_differences() {
        for residual in [false, true] {
            let layers = 3;
            let (input_size, hidden) = (2, 3);
            let batch = 2;

            let mut cell = stack(layers, input_size, hidden, residual);
            cell.begin_forward(batch, true).unwrap();

            let mut rng = SmallRng::seed_from_u64(13);
            let state: Vec<_> = (0..layers).map(|_| xavier((batch, hidden), &mut rng)).collect();
            let input = xavier((batch, input_size), &mut rng);

            let ones = vec![Array2::from_elem((batch, hidden), 1.0); layers];
            let loss = |cell: &mut GruStack, input: &Array2<f32>, state: &Vec<Array2<f32>>| {
                let (next, _) = cell.step(state, input.view()).unwrap();
                next.iter().map(|c| c.sum()).sum::<f32>()
            };

            cell.zero_grad();
            let (_, cache) = cell.step(&state, input.view()).unwrap();
            let (grad_state, grad_input) = cell
                .step_backward(&state, input.view(), &cache, &ones)
                .unwrap();

            let eps = 5e-3;
            let check = |got: f32, want: f32| {
                assert!(
                    (got - want).abs() <= 1e-2 + 0.05 * want.abs(),
                    "gradient {got} vs finite difference {want} (residual = {residual})"
                );
            };

            for idx in [[0, 0], [1, 1]] {
                let mut plus = input.clone();
                plus[idx] += eps;
                let mut minus = input.clone();
                minus[idx] -= eps;
                let fd = (loss(&mut cell, &plus, &state) - loss(&mut cell, &minus, &state))
                    / (2.0 * eps);
                check(grad_input[idx], fd);
            }

            for (c, component) in grad_state.iter().enumerate() {
                let mut plus = state.clone();
                plus[c][[1, 2]] += eps;
                let mut minus = state.clone();
                minus[c][[1, 2]] -= eps;
                let fd =
                    (loss(&mut cell, &input, &plus) - loss(&mut cell, &input, &minus)) / (2.0 * eps);
                check(component[[1, 2]], fd);
            }

            for (r, c) in [(0, 0), (2, 4)] {
                let mut plus = cell.clone();
                plus.layers[1].w_hh[[r, c]] += eps;
                let mut minus = cell.clone();
                minus.layers[1].w_hh[[r, c]] -= eps;
                let fd = (loss(&mut plus, &input, &state) - loss(&mut minus, &input, &state))
                    / (2.0 * eps);
                check(cell.layers[1].gw_hh[[r, c]], fd);
            }
        }
    }
}
