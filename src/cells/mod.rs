//! Recurrent cells: the per-step state transition under the unroller.
//!
//! A cell owns its parameters and their gradient accumulators; the unroller
//! owns time. `step` advances one time step and returns the retained
//! intermediates as an opaque cache, `step_backward` consumes that cache and
//! accumulates parameter gradients in place.

mod gru;
mod lstm;
pub mod noise;

pub use gru::{GruCache, GruStack};
pub use lstm::{LstmCache, LstmStack};

use ndarray::{Array2, ArrayView2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    EncoderErr, Result,
    config::{CellType, DropoutMode},
};

/// A recurrent state transition with explicit reverse-mode support.
///
/// State is a vector of `[batch, hidden]` components; the last component is
/// the step's visible output. `num_states` fixes the arity for the cell's
/// lifetime.
pub trait RecurrentCell {
    /// Forward intermediates retained for one step's backward pass.
    type Cache;

    fn num_states(&self) -> usize;
    fn hidden_size(&self) -> usize;
    fn input_size(&self) -> usize;

    /// Announces a new forward call so the cell can refresh per-call noise.
    fn begin_forward(&mut self, batch_size: usize, training: bool) -> Result<()>;

    /// One step forward: `(state, input) -> (next state, cache)`.
    fn step(
        &mut self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
    ) -> Result<(Vec<Array2<f32>>, Self::Cache)>;

    /// One step of reverse mode. `grad_next` is the loss gradient with
    /// respect to the step's output state; the return is the gradient with
    /// respect to the incoming state and the step input. Parameter gradients
    /// are accumulated into the cell.
    fn step_backward(
        &mut self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
        cache: &Self::Cache,
        grad_next: &[Array2<f32>],
    ) -> Result<(Vec<Array2<f32>>, Array2<f32>)>;

    fn zero_grad(&mut self);
}

/// Numerically stable logistic function.
pub(crate) fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Uniform Xavier/Glorot initialization for a `[rows, cols]` projection.
pub(crate) fn xavier(shape: (usize, usize), rng: &mut SmallRng) -> Array2<f32> {
    let bound = (6.0 / (shape.0 + shape.1) as f32).sqrt();
    Array2::from_shape_simple_fn(shape, || rng.random_range(-bound..bound))
}

/// Replacement rng for deserialized cells (serde skips the rng field).
pub(crate) fn default_rng() -> SmallRng {
    SmallRng::seed_from_u64(0)
}

/// Closed set of cell implementations, dispatched by variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Cell {
    Lstm(LstmStack),
    Gru(GruStack),
}

#[derive(Clone, Debug)]
pub enum CellCache {
    Lstm(LstmCache),
    Gru(GruCache),
}

impl Cell {
    pub fn cell_type(&self) -> CellType {
        match self {
            Cell::Lstm(_) => CellType::Lstm,
            Cell::Gru(_) => CellType::Gru,
        }
    }

    pub fn dropout_mode(&self) -> DropoutMode {
        match self {
            Cell::Lstm(c) => c.noise().mode(),
            Cell::Gru(c) => c.noise().mode(),
        }
    }
}

impl RecurrentCell for Cell {
    type Cache = CellCache;

    fn num_states(&self) -> usize {
        match self {
            Cell::Lstm(c) => c.num_states(),
            Cell::Gru(c) => c.num_states(),
        }
    }

    fn hidden_size(&self) -> usize {
        match self {
            Cell::Lstm(c) => c.hidden_size(),
            Cell::Gru(c) => c.hidden_size(),
        }
    }

    fn input_size(&self) -> usize {
        match self {
            Cell::Lstm(c) => c.input_size(),
            Cell::Gru(c) => c.input_size(),
        }
    }

    fn begin_forward(&mut self, batch_size: usize, training: bool) -> Result<()> {
        match self {
            Cell::Lstm(c) => c.begin_forward(batch_size, training),
            Cell::Gru(c) => c.begin_forward(batch_size, training),
        }
    }

    fn step(
        &mut self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
    ) -> Result<(Vec<Array2<f32>>, CellCache)> {
        match self {
            Cell::Lstm(c) => {
                let (next, cache) = c.step(state, input)?;
                Ok((next, CellCache::Lstm(cache)))
            }
            Cell::Gru(c) => {
                let (next, cache) = c.step(state, input)?;
                Ok((next, CellCache::Gru(cache)))
            }
        }
    }

    fn step_backward(
        &mut self,
        state: &[Array2<f32>],
        input: ArrayView2<f32>,
        cache: &CellCache,
        grad_next: &[Array2<f32>],
    ) -> Result<(Vec<Array2<f32>>, Array2<f32>)> {
        match (self, cache) {
            (Cell::Lstm(c), CellCache::Lstm(cache)) => {
                c.step_backward(state, input, cache, grad_next)
            }
            (Cell::Gru(c), CellCache::Gru(cache)) => {
                c.step_backward(state, input, cache, grad_next)
            }
            _ => Err(EncoderErr::CacheMismatch),
        }
    }

    fn zero_grad(&mut self) {
        match self {
            Cell::Lstm(c) => c.zero_grad(),
            Cell::Gru(c) => c.zero_grad(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;

    #[test]
    fn sigmoid_is_stable_at_the_tails() {
        assert!(sigmoid(-100.0) >= 0.0);
        assert!(sigmoid(100.0) <= 1.0);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!((sigmoid(3.0) + sigmoid(-3.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn xavier_respects_its_bound() {
        let mut rng = default_rng();
        let w = xavier((16, 16), &mut rng);
        let bound = (6.0 / 32.0f32).sqrt();
        assert!(w.iter().all(|v| v.abs() <= bound));
        assert!(w.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn enum_dispatch_rejects_foreign_caches() {
        let cfg = EncoderConfig::new(1, 4, CellType::Lstm);
        let mut rng = default_rng();
        let mut lstm = Cell::Lstm(LstmStack::new(&cfg, 3, &mut rng).unwrap());
        let mut gru = Cell::Gru(GruStack::new(&cfg, 3, &mut rng).unwrap());

        lstm.begin_forward(2, false).unwrap();
        gru.begin_forward(2, false).unwrap();

        let state = vec![Array2::zeros((2, 4)); 2];
        let gru_state = vec![Array2::zeros((2, 4)); 1];
        let input = Array2::zeros((2, 3));

        let (_, cache) = gru.step(&gru_state, input.view()).unwrap();
        let grads = vec![Array2::zeros((2, 4)); 2];
        assert!(matches!(
            lstm.step_backward(&state, input.view(), &cache, &grads),
            Err(EncoderErr::CacheMismatch)
        ));
    }

    #[test]
    fn state_arity_differs_by_variant() {
        let cfg = EncoderConfig::new(3, 4, CellType::Lstm);
        let mut rng = default_rng();
        let lstm = Cell::Lstm(LstmStack::new(&cfg, 2, &mut rng).unwrap());
        let gru = Cell::Gru(GruStack::new(&cfg, 2, &mut rng).unwrap());

        assert_eq!(lstm.num_states(), 6);
        assert_eq!(gru.num_states(), 3);
    }
}
