use ndarray::Array2;

/// Whether step `t` (0-based) is padding for a sample with the given valid
/// length, under left-padding: real tokens occupy the last `source_size`
/// steps of the unroll.
pub fn is_padded(source_size: usize, source_length: usize, t: usize) -> bool {
    t + source_size < source_length
}

/// Zeroes row `b` of every state component for each sample `b` whose sequence
/// has not yet started at step `t`.
///
/// Applied after the cell step in forward and after the context-gradient
/// injection in backward; the two must stay mirror images or padded positions
/// leak state forward and gradient backward.
pub fn zero_padded_rows(
    components: &mut [Array2<f32>],
    source_sizes: &[usize],
    source_length: usize,
    t: usize,
) {
    for (b, &size) in source_sizes.iter().enumerate() {
        if is_padded(size, source_length, t) {
            for component in components.iter_mut() {
                component.row_mut(b).fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_padding_convention() {
        // source_length = 4, valid length = 2: steps 0 and 1 are padding.
        assert!(is_padded(2, 4, 0));
        assert!(is_padded(2, 4, 1));
        assert!(!is_padded(2, 4, 2));
        assert!(!is_padded(2, 4, 3));

        // Full-length sample is never padded.
        for t in 0..4 {
            assert!(!is_padded(4, 4, t));
        }
    }

    #[test]
    fn zeroes_only_padded_samples() {
        let mut components = vec![Array2::from_elem((3, 2), 1.0), Array2::from_elem((3, 2), 2.0)];

        zero_padded_rows(&mut components, &[3, 1, 2], 3, 0);

        for component in &components {
            assert!(component.row(0).iter().all(|&v| v != 0.0));
            assert!(component.row(1).iter().all(|&v| v == 0.0));
            assert!(component.row(2).iter().all(|&v| v == 0.0));
        }

        let mut components = vec![Array2::from_elem((3, 2), 1.0)];
        zero_padded_rows(&mut components, &[3, 1, 2], 3, 1);
        assert!(components[0].row(1).iter().all(|&v| v == 0.0));
        assert!(components[0].row(2).iter().all(|&v| v != 0.0));
    }
}
