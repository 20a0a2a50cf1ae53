use log::debug;
use ndarray::{Array2, Array3};

/// Reusable, shape-keyed tensor storage.
///
/// The pool owns three prototypes: the initial-state buffer, the backward
/// gradient accumulator and the context matrix. Each is sized lazily on first
/// use and resized only when the requested shape differs from the held one;
/// otherwise the same backing storage is handed out again. Callers that need a
/// value to outlive the next acquire must copy it.
#[derive(Debug, Default)]
pub struct BufferPool {
    state: Vec<Array2<f32>>,
    grad: Vec<Array2<f32>>,
    context: Array3<f32>,
}

fn fit_state(
    slot: &mut Vec<Array2<f32>>,
    what: &'static str,
    n: usize,
    shape: (usize, usize),
) -> bool {
    let held = (slot.len(), slot.first().map(Array2::dim));
    if held == (n, Some(shape)) || (n == 0 && slot.is_empty()) {
        return false;
    }

    debug!("pool: resizing {what} buffer to {n} x {shape:?}");
    *slot = (0..n).map(|_| Array2::zeros(shape)).collect();
    true
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state buffer of `n` components shaped `shape`. Zero-filled on first
    /// allocation only; on reuse the previous contents are left in place.
    pub fn acquire_state(&mut self, n: usize, shape: (usize, usize)) -> &mut [Array2<f32>] {
        fit_state(&mut self.state, "state", n, shape);
        &mut self.state
    }

    /// Same as `acquire_state` but guaranteed all-zero on every call.
    pub fn acquire_zeroed_state(&mut self, n: usize, shape: (usize, usize)) -> &mut [Array2<f32>] {
        if !fit_state(&mut self.state, "state", n, shape) {
            for component in &mut self.state {
                component.fill(0.0);
            }
        }
        &mut self.state
    }

    /// The gradient accumulator, an entry independent from the state buffer.
    pub fn acquire_grad_state(&mut self, n: usize, shape: (usize, usize)) -> &mut [Array2<f32>] {
        fit_state(&mut self.grad, "grad", n, shape);
        &mut self.grad
    }

    pub fn acquire_zeroed_grad_state(
        &mut self,
        n: usize,
        shape: (usize, usize),
    ) -> &mut [Array2<f32>] {
        if !fit_state(&mut self.grad, "grad", n, shape) {
            for component in &mut self.grad {
                component.fill(0.0);
            }
        }
        &mut self.grad
    }

    /// The context matrix, `[batch, source_length, hidden]`.
    pub fn acquire_context(&mut self, shape: (usize, usize, usize)) -> &mut Array3<f32> {
        if self.context.dim() != shape {
            debug!("pool: resizing context buffer to {shape:?}");
            self.context = Array3::zeros(shape);
        }
        &mut self.context
    }

    /// Read access to the context most recently filled by a forward pass.
    pub fn context(&self) -> &Array3<f32> {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fills_on_first_allocation_only() {
        let mut pool = BufferPool::new();

        let state = pool.acquire_state(2, (2, 3));
        assert_eq!(state.len(), 2);
        assert!(state.iter().all(|c| c.iter().all(|&v| v == 0.0)));

        state[0][[0, 0]] = 7.0;
        let state = pool.acquire_state(2, (2, 3));
        assert_eq!(state[0][[0, 0]], 7.0);

        let state = pool.acquire_zeroed_state(2, (2, 3));
        assert_eq!(state[0][[0, 0]], 0.0);
    }

    #[test]
    fn reuses_backing_storage_for_matching_shapes() {
        let mut pool = BufferPool::new();

        let before = pool.acquire_state(1, (4, 4))[0].as_ptr();
        let after = pool.acquire_state(1, (4, 4))[0].as_ptr();
        assert_eq!(before, after);

        let resized = pool.acquire_state(1, (4, 5))[0].as_ptr();
        assert_ne!(before, resized);

        let ctx = pool.acquire_context((2, 3, 4)).as_ptr();
        assert_eq!(ctx, pool.acquire_context((2, 3, 4)).as_ptr());
        assert_ne!(ctx, pool.acquire_context((2, 4, 4)).as_ptr());
    }

    #[test]
    fn state_and_grad_entries_are_independent() {
        let mut pool = BufferPool::new();

        pool.acquire_state(1, (2, 2))[0].fill(1.0);
        let grad = pool.acquire_zeroed_grad_state(1, (2, 2));
        assert!(grad[0].iter().all(|&v| v == 0.0));

        let state = pool.acquire_state(1, (2, 2));
        assert!(state[0].iter().all(|&v| v == 1.0));
    }
}
