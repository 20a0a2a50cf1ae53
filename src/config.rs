use std::str::FromStr;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::{
    EncoderErr, Result,
    cells::{Cell, GruStack, LstmStack},
    encoder::Encoder,
    transform::Embedding,
};

/// The recurrent cell variant. Selects the state arity per layer (2 for LSTM,
/// 1 for GRU) and the gate math.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellType {
    Lstm,
    Gru,
}

impl FromStr for CellType {
    type Err = EncoderErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lstm" => Ok(CellType::Lstm),
            "gru" => Ok(CellType::Gru),
            _ => Err(EncoderErr::UnknownCellType(s.to_string())),
        }
    }
}

/// How dropout noise is resampled over time.
///
/// `Naive` samples fresh masks at every time step; `Variational` samples one
/// set of masks per forward call and holds it fixed across all time steps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropoutMode {
    #[default]
    Naive,
    Variational,
}

impl FromStr for DropoutMode {
    type Err = EncoderErr;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "naive" => Ok(DropoutMode::Naive),
            "variational" => Ok(DropoutMode::Variational),
            _ => Err(EncoderErr::UnknownDropoutMode(s.to_string())),
        }
    }
}

/// Construction-time configuration of the encoder.
///
/// All fields are plain data; `validate` checks them and `build` produces a
/// ready encoder. Invalid values are reported before any tensor is allocated.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Recurrent depth (stacked layers inside the cell).
    pub layers: usize,
    /// Size of each state component's feature dimension.
    pub hidden_size: usize,
    pub cell_type: CellType,
    /// Dropout rate between stacked recurrent layers.
    pub dropout: f32,
    /// Dropout rate on the transformed input features.
    pub input_dropout: f32,
    /// Probability of dropping a whole token's vector in the input transform.
    pub word_dropout: f32,
    pub dropout_mode: DropoutMode,
    /// Add skip connections on the feedforward path between stacked layers.
    pub residual: bool,
}

impl EncoderConfig {
    pub fn new(layers: usize, hidden_size: usize, cell_type: CellType) -> Self {
        Self {
            layers,
            hidden_size,
            cell_type,
            dropout: 0.0,
            input_dropout: 0.0,
            word_dropout: 0.0,
            dropout_mode: DropoutMode::default(),
            residual: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.layers == 0 {
            return Err(EncoderErr::ZeroDim { what: "layer count" });
        }
        if self.hidden_size == 0 {
            return Err(EncoderErr::ZeroDim {
                what: "hidden size",
            });
        }

        for (what, rate) in [
            ("dropout", self.dropout),
            ("input dropout", self.input_dropout),
            ("word dropout", self.word_dropout),
        ] {
            if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
                return Err(EncoderErr::InvalidRate { what, rate });
            }
        }

        Ok(())
    }

    /// Builds an encoder over a token vocabulary, with an embedding lookup as
    /// the input transform. `seed` fixes weight initialization.
    pub fn build(
        &self,
        vocab_size: usize,
        embed_size: usize,
        seed: u64,
    ) -> Result<Encoder<Cell, Embedding>> {
        self.validate()?;

        if vocab_size == 0 {
            return Err(EncoderErr::ZeroDim { what: "vocab size" });
        }
        if embed_size == 0 {
            return Err(EncoderErr::ZeroDim { what: "embed size" });
        }

        let mut rng = SmallRng::seed_from_u64(seed);
        let transform = Embedding::new(vocab_size, embed_size, self.word_dropout, &mut rng)?;

        let cell = match self.cell_type {
            CellType::Lstm => Cell::Lstm(LstmStack::new(self, embed_size, &mut rng)?),
            CellType::Gru => Cell::Gru(GruStack::new(self, embed_size, &mut rng)?),
        };

        Encoder::new(cell, transform)
    }
}
