use std::rc::Rc;

use ndarray::Array2;
use rand::Rng;
use rand::rngs::SmallRng;
use rand_distr::Bernoulli;
use serde::{Deserialize, Serialize};

use crate::{EncoderErr, Result, config::DropoutMode};

/// One dropout site with inverted scaling: kept entries are multiplied by
/// `1/(1-rate)` so evaluation needs no rescale.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    pub fn new(what: &'static str, rate: f32) -> Result<Self> {
        if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
            return Err(EncoderErr::InvalidRate { what, rate });
        }

        Ok(Self { rate })
    }

    pub fn is_active(&self) -> bool {
        self.rate > 0.0
    }

    /// Samples a fresh mask, or `None` when this site is inactive.
    pub fn sample(
        &self,
        shape: (usize, usize),
        rng: &mut SmallRng,
    ) -> Result<Option<Rc<Array2<f32>>>> {
        if !self.is_active() {
            return Ok(None);
        }
        if self.rate >= 1.0 {
            return Ok(Some(Rc::new(Array2::zeros(shape))));
        }

        let keep = Bernoulli::new(f64::from(1.0 - self.rate)).map_err(|_| {
            EncoderErr::InvalidRate {
                what: "dropout keep probability",
                rate: self.rate,
            }
        })?;
        let scale = 1.0 / (1.0 - self.rate);

        let mask = Array2::from_shape_simple_fn(shape, || {
            if rng.sample(keep) { scale } else { 0.0 }
        });
        Ok(Some(Rc::new(mask)))
    }
}

/// The dropout masks in effect for one time step. Shared via `Rc` so a
/// retained step cache keeps the exact forward noise alive for backward even
/// after the plan resamples.
#[derive(Clone, Debug, Default)]
pub struct StepNoise {
    /// Mask over the transformed input features, `[batch, input_size]`.
    pub input: Option<Rc<Array2<f32>>>,
    /// Masks between stacked layers, one per transition, `[batch, hidden]`.
    pub layers: Vec<Option<Rc<Array2<f32>>>>,
}

impl StepNoise {
    fn silent(transitions: usize) -> Self {
        Self {
            input: None,
            layers: vec![None; transitions],
        }
    }
}

/// Resampling policy for a stacked cell's dropout sites.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NoisePlan {
    mode: DropoutMode,
    input: Dropout,
    hidden: Dropout,
    input_size: usize,
    hidden_size: usize,
    /// Inter-layer transitions (`layers - 1`).
    transitions: usize,
    #[serde(skip)]
    held: Option<StepNoise>,
}

impl NoisePlan {
    pub fn new(
        mode: DropoutMode,
        input_rate: f32,
        hidden_rate: f32,
        layers: usize,
        input_size: usize,
        hidden_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            mode,
            input: Dropout::new("input dropout", input_rate)?,
            hidden: Dropout::new("dropout", hidden_rate)?,
            input_size,
            hidden_size,
            transitions: layers.saturating_sub(1),
            held: None,
        })
    }

    pub fn mode(&self) -> DropoutMode {
        self.mode
    }

    fn sample_all(&self, batch: usize, rng: &mut SmallRng) -> Result<StepNoise> {
        let input = self.input.sample((batch, self.input_size), rng)?;
        let layers = (0..self.transitions)
            .map(|_| self.hidden.sample((batch, self.hidden_size), rng))
            .collect::<Result<_>>()?;

        Ok(StepNoise { input, layers })
    }

    /// Called once per encoder forward call. In variational mode this is the
    /// single point where noise is resampled.
    pub fn begin_forward(&mut self, batch: usize, training: bool, rng: &mut SmallRng) -> Result<()> {
        self.held = if training && self.mode == DropoutMode::Variational {
            Some(self.sample_all(batch, rng)?)
        } else {
            None
        };

        Ok(())
    }

    /// The masks for the current time step: fresh ones in naive mode, clones
    /// of the per-call set in variational mode, silence in evaluation.
    pub fn step_masks(&mut self, batch: usize, training: bool, rng: &mut SmallRng) -> Result<StepNoise> {
        if !training {
            return Ok(StepNoise::silent(self.transitions));
        }

        match self.mode {
            DropoutMode::Variational => Ok(self
                .held
                .clone()
                .unwrap_or_else(|| StepNoise::silent(self.transitions))),
            DropoutMode::Naive => self.sample_all(batch, rng),
        }
    }
}
