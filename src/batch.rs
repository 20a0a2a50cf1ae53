use ndarray::{Array2, ArrayView1};

use crate::{EncoderErr, Result};

/// A batch of token sequences, read-only to the encoder.
///
/// `source` is `[batch, source_length]` with sequences left-padded: a sample
/// whose valid length is `L < source_length` carries padding at steps
/// `t < source_length - L` and its real tokens at the tail.
#[derive(Clone, Debug)]
pub struct Batch {
    source: Array2<usize>,
    source_sizes: Option<Vec<usize>>,
}

impl Batch {
    /// A batch where every sample uses the full `source_length`.
    pub fn new(source: Array2<usize>) -> Self {
        Self {
            source,
            source_sizes: None,
        }
    }

    /// A batch with per-sample valid lengths, `1..=source_length` each.
    pub fn with_sizes(source: Array2<usize>, sizes: Vec<usize>) -> Result<Self> {
        let (batch, len) = source.dim();

        if sizes.len() != batch {
            return Err(EncoderErr::ArityMismatch {
                what: "source sizes",
                got: sizes.len(),
                expected: batch,
            });
        }
        for (sample, &size) in sizes.iter().enumerate() {
            if size == 0 || size > len {
                return Err(EncoderErr::BadSourceSize {
                    sample,
                    size,
                    max: len,
                });
            }
        }

        Ok(Self {
            source,
            source_sizes: Some(sizes),
        })
    }

    /// Number of sequences in the batch.
    pub fn size(&self) -> usize {
        self.source.nrows()
    }

    /// Number of time steps to unroll.
    pub fn source_length(&self) -> usize {
        self.source.ncols()
    }

    /// The raw per-step input: one token id per sample.
    pub fn source_input(&self, t: usize) -> ArrayView1<'_, usize> {
        self.source.column(t)
    }

    pub fn has_variable_lengths(&self) -> bool {
        self.source_sizes.is_some()
    }

    pub fn source_sizes(&self) -> Option<&[usize]> {
        self.source_sizes.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn exposes_dims_and_steps() {
        let batch = Batch::new(array![[1, 2, 3], [4, 5, 6]]);

        assert_eq!(batch.size(), 2);
        assert_eq!(batch.source_length(), 3);
        assert!(!batch.has_variable_lengths());
        assert_eq!(batch.source_input(1), array![2, 5].view());
    }

    #[test]
    fn validates_sizes() {
        let source = array![[0, 1, 2], [0, 0, 3]];

        let ok = Batch::with_sizes(source.clone(), vec![3, 1]).unwrap();
        assert_eq!(ok.source_sizes(), Some(&[3, 1][..]));

        assert!(matches!(
            Batch::with_sizes(source.clone(), vec![3]),
            Err(EncoderErr::ArityMismatch { .. })
        ));
        assert!(matches!(
            Batch::with_sizes(source.clone(), vec![3, 4]),
            Err(EncoderErr::BadSourceSize { sample: 1, .. })
        ));
        assert!(matches!(
            Batch::with_sizes(source, vec![0, 2]),
            Err(EncoderErr::BadSourceSize { sample: 0, .. })
        ));
    }
}
