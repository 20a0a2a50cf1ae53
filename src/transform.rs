use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rand::rngs::SmallRng;
use rand_distr::Bernoulli;
use serde::{Deserialize, Serialize};

use crate::cells::{default_rng, xavier};
use crate::{EncoderErr, Result};

/// Turns one time step of raw batch input into the feature matrix the cell
/// consumes.
///
/// Like the cell, a transform accumulates its own parameter gradients during
/// `backward` and hands the unroller an opaque per-step cache.
pub trait InputTransform {
    type Cache;

    /// Feature width of the produced matrices.
    fn output_size(&self) -> usize;

    /// Announces a new forward call and its train/eval mode.
    fn begin_forward(&mut self, training: bool);

    /// Maps one step's tokens (one per sample) to `[batch, output_size]`.
    fn forward(&mut self, tokens: ArrayView1<usize>) -> Result<(Array2<f32>, Self::Cache)>;

    /// Accumulates parameter gradients given the loss gradient with respect
    /// to this step's forward output.
    fn backward(&mut self, cache: &Self::Cache, grad: &Array2<f32>) -> Result<()>;

    fn zero_grad(&mut self);
}

#[derive(Clone, Debug)]
pub struct EmbeddingCache {
    tokens: Vec<usize>,
    /// Per-sample keep scale for word dropout, `None` outside training.
    row_mask: Option<Array1<f32>>,
}

/// Token embedding lookup with word-level dropout.
///
/// Word dropout zeroes a token's whole vector with probability `word_dropout`
/// and scales kept vectors by `1/(1-rate)`; the per-step row mask is replayed
/// in `backward` so dropped tokens accumulate no gradient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Embedding {
    weights: Array2<f32>,
    word_dropout: f32,

    #[serde(skip)]
    grad: Array2<f32>,
    #[serde(skip, default = "default_rng")]
    rng: SmallRng,
    #[serde(skip)]
    training: bool,
}

impl Embedding {
    pub fn new(
        vocab_size: usize,
        embed_size: usize,
        word_dropout: f32,
        rng: &mut SmallRng,
    ) -> Result<Self> {
        if vocab_size == 0 {
            return Err(EncoderErr::ZeroDim { what: "vocab size" });
        }
        if embed_size == 0 {
            return Err(EncoderErr::ZeroDim { what: "embed size" });
        }
        if !word_dropout.is_finite() || !(0.0..=1.0).contains(&word_dropout) {
            return Err(EncoderErr::InvalidRate {
                what: "word dropout",
                rate: word_dropout,
            });
        }

        Ok(Self {
            weights: xavier((vocab_size, embed_size), rng),
            word_dropout,
            grad: Array2::zeros((vocab_size, embed_size)),
            rng: default_rng(),
            training: false,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Array2<f32> {
        &mut self.weights
    }

    pub fn grad(&self) -> &Array2<f32> {
        &self.grad
    }

    fn sample_row_mask(&mut self, batch: usize) -> Result<Option<Array1<f32>>> {
        if !self.training || self.word_dropout <= 0.0 {
            return Ok(None);
        }
        if self.word_dropout >= 1.0 {
            return Ok(Some(Array1::zeros(batch)));
        }

        let keep = Bernoulli::new(f64::from(1.0 - self.word_dropout)).map_err(|_| {
            EncoderErr::InvalidRate {
                what: "word dropout keep probability",
                rate: self.word_dropout,
            }
        })?;
        let scale = 1.0 / (1.0 - self.word_dropout);

        let mask = Array1::from_shape_fn(batch, |_| {
            if self.rng.sample(keep) { scale } else { 0.0 }
        });
        Ok(Some(mask))
    }
}

impl InputTransform for Embedding {
    type Cache = EmbeddingCache;

    fn output_size(&self) -> usize {
        self.weights.ncols()
    }

    fn begin_forward(&mut self, training: bool) {
        self.training = training;
    }

    fn forward(&mut self, tokens: ArrayView1<usize>) -> Result<(Array2<f32>, EmbeddingCache)> {
        let batch = tokens.len();
        let vocab = self.weights.nrows();
        for &token in tokens.iter() {
            if token >= vocab {
                return Err(EncoderErr::TokenOutOfRange { token, vocab });
            }
        }

        let row_mask = self.sample_row_mask(batch)?;

        let mut out = Array2::zeros((batch, self.weights.ncols()));
        for (b, &token) in tokens.iter().enumerate() {
            let scale = row_mask.as_ref().map_or(1.0, |m| m[b]);
            if scale != 0.0 {
                out.row_mut(b).assign(&self.weights.row(token));
                if scale != 1.0 {
                    out.row_mut(b).mapv_inplace(|v| v * scale);
                }
            }
        }

        Ok((out, EmbeddingCache {
            tokens: tokens.to_vec(),
            row_mask,
        }))
    }

    fn backward(&mut self, cache: &EmbeddingCache, grad: &Array2<f32>) -> Result<()> {
        let expected = (cache.tokens.len(), self.weights.ncols());
        if grad.dim() != expected {
            return Err(EncoderErr::ShapeMismatch {
                what: "transform output gradient",
                got: grad.shape().to_vec(),
                expected: vec![expected.0, expected.1],
            });
        }

        for (b, &token) in cache.tokens.iter().enumerate() {
            let scale = cache.row_mask.as_ref().map_or(1.0, |m| m[b]);
            if scale != 0.0 {
                let mut row = self.grad.row_mut(token);
                row.scaled_add(scale, &grad.index_axis(Axis(0), b));
            }
        }

        Ok(())
    }

    fn zero_grad(&mut self) {
        if self.grad.dim() != self.weights.dim() {
            self.grad = Array2::zeros(self.weights.dim());
        } else {
            self.grad.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn embedding(vocab: usize, embed: usize, word_dropout: f32) -> Embedding {
        let mut rng = default_rng();
        Embedding::new(vocab, embed, word_dropout, &mut rng).unwrap()
    }

    #[test]
    fn looks_up_rows_by_token() {
        let mut embed = embedding(5, 3, 0.0);
        embed.begin_forward(false);

        let tokens = arr1(&[2usize, 0]);
        let (out, _) = embed.forward(tokens.view()).unwrap();

        assert_eq!(out.dim(), (2, 3));
        assert_eq!(out.row(0), embed.weights.row(2));
        assert_eq!(out.row(1), embed.weights.row(0));
    }

    #[test]
    fn rejects_out_of_range_tokens() {
        let mut embed = embedding(4, 2, 0.0);
        embed.begin_forward(false);

        let tokens = arr1(&[1usize, 4]);
        assert!(matches!(
            embed.forward(tokens.view()),
            Err(EncoderErr::TokenOutOfRange { token: 4, vocab: 4 })
        ));
    }

    #[test]
    fn gradient_scatters_into_token_rows() {
        let mut embed = embedding(4, 2, 0.0);
        embed.begin_forward(true);
        embed.zero_grad();

        // Token 1 appears twice, so its row accumulates both sample rows.
        let tokens = arr1(&[1usize, 1]);
        let (_, cache) = embed.forward(tokens.view()).unwrap();
        let grad = Array2::from_elem((2, 2), 0.5);
        embed.backward(&cache, &grad).unwrap();

        assert!(embed.grad.row(1).iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(embed.grad.row(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn word_dropout_zeroes_whole_rows_and_their_gradient() {
        let mut embed = embedding(8, 4, 0.5);
        embed.begin_forward(true);
        embed.zero_grad();

        let tokens = arr1(&[0usize, 1, 2, 3, 4, 5, 6, 7]);
        let (out, cache) = embed.forward(tokens.view()).unwrap();
        let mask = cache.row_mask.clone().unwrap();
        assert!(mask.iter().any(|&v| v == 0.0));
        assert!(mask.iter().any(|&v| v != 0.0));

        let grad = Array2::from_elem((8, 4), 1.0);
        embed.backward(&cache, &grad).unwrap();

        for (b, &scale) in mask.iter().enumerate() {
            if scale == 0.0 {
                assert!(out.row(b).iter().all(|&v| v == 0.0));
                assert!(embed.grad.row(b).iter().all(|&v| v == 0.0));
            } else {
                assert!(embed.grad.row(b).iter().all(|&v| (v - scale).abs() < 1e-6));
            }
        }
    }

    #[test]
    fn evaluation_disables_word_dropout() {
        let mut embed = embedding(4, 2, 0.9);
        embed.begin_forward(false);

        let tokens = arr1(&[0usize, 1, 2, 3]);
        let (_, cache) = embed.forward(tokens.view()).unwrap();
        assert!(cache.row_mask.is_none());
    }
}
