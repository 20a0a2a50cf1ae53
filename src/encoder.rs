use log::debug;
use ndarray::{Array2, Array3, ArrayView1, s};

use crate::batch::Batch;
use crate::cells::RecurrentCell;
use crate::mask::zero_padded_rows;
use crate::pool::BufferPool;
use crate::transform::InputTransform;
use crate::{EncoderErr, Result};

/// Everything one unrolled step retains for its backward pass: the state fed
/// into the step, the transformed input, and both collaborators' caches.
struct StepRecord<C: RecurrentCell, T: InputTransform> {
    state: Vec<Array2<f32>>,
    input: Array2<f32>,
    cell: C::Cache,
    transform: T::Cache,
}

/// The result of a forward pass, borrowed from the encoder's buffers.
///
/// Both views alias storage the next `forward`/`forward_one_step` call will
/// overwrite; the borrow makes that lifetime explicit. Callers that need the
/// values longer copy them out.
#[derive(Debug)]
pub struct Encoded<'a> {
    /// Per-step top-layer outputs, `[batch, source_length, hidden]`.
    pub context: &'a Array3<f32>,
    /// Final state after the last step, `num_states` components.
    pub state: &'a [Array2<f32>],
}

impl Encoded<'_> {
    /// The last step's visible output, `[batch, hidden]`.
    pub fn output(&self) -> &Array2<f32> {
        &self.state[self.state.len() - 1]
    }
}

/// Unrolls a recurrent cell over the time axis of a batch.
///
/// The unroller owns time and nothing else: the cell owns the transition
/// math, the input transform owns the raw-input-to-features mapping, and the
/// pool owns tensor reuse. In training mode `forward` retains one
/// [`StepRecord`] per step so that `backward` can replay the unroll in
/// reverse and push gradient through every step.
pub struct Encoder<C: RecurrentCell, T: InputTransform> {
    cell: C,
    transform: T,

    pool: BufferPool,
    training: bool,
    retained: Vec<StepRecord<C, T>>,
    /// `(batch, source_length)` of the retained pass, if any.
    retained_batch: Option<(usize, usize)>,
    final_state: Vec<Array2<f32>>,
}

impl<C: RecurrentCell, T: InputTransform> Encoder<C, T> {
    pub fn new(cell: C, transform: T) -> Result<Self> {
        if transform.output_size() != cell.input_size() {
            return Err(EncoderErr::ShapeMismatch {
                what: "transform output vs cell input",
                got: vec![transform.output_size()],
                expected: vec![cell.input_size()],
            });
        }

        Ok(Self {
            cell,
            transform,
            pool: BufferPool::new(),
            training: false,
            retained: Vec::new(),
            retained_batch: None,
            final_state: Vec::new(),
        })
    }

    pub fn cell(&self) -> &C {
        &self.cell
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut T {
        &mut self.transform
    }

    pub fn into_parts(self) -> (C, T) {
        (self.cell, self.transform)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switches between training mode (steps retained, noise active) and
    /// evaluation mode. Dropping to evaluation discards any retained pass.
    pub fn set_train(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.retained.clear();
            self.retained_batch = None;
        }
    }

    fn check_batch(batch: &Batch) -> Result<()> {
        if batch.size() == 0 {
            return Err(EncoderErr::ZeroDim { what: "batch size" });
        }
        if batch.source_length() == 0 {
            return Err(EncoderErr::ZeroDim {
                what: "source length",
            });
        }

        Ok(())
    }

    /// Unrolls the cell over the whole batch from a zero initial state.
    pub fn forward(&mut self, batch: &Batch) -> Result<Encoded<'_>> {
        self.forward_from(batch, None)
    }

    /// Unrolls the cell over the whole batch, left to right.
    ///
    /// Each step transforms the raw input, advances the cell, zeroes the
    /// state rows of samples whose sequence has not started yet, and writes
    /// the top output into the context matrix. In training mode the step is
    /// also retained for `backward`. The initial state defaults to zero.
    pub fn forward_from(
        &mut self,
        batch: &Batch,
        initial_state: Option<&[Array2<f32>]>,
    ) -> Result<Encoded<'_>> {
        Self::check_batch(batch)?;

        let (b, len) = (batch.size(), batch.source_length());
        let (n, h) = (self.cell.num_states(), self.cell.hidden_size());
        debug!("forward: {b} x {len}, training = {}", self.training);

        self.cell.begin_forward(b, self.training)?;
        self.transform.begin_forward(self.training);
        self.retained.clear();
        self.retained_batch = None;

        let mut state = match initial_state {
            Some(init) => {
                if init.len() != n {
                    return Err(EncoderErr::ArityMismatch {
                        what: "initial state components",
                        got: init.len(),
                        expected: n,
                    });
                }
                for component in init {
                    if component.dim() != (b, h) {
                        return Err(EncoderErr::ShapeMismatch {
                            what: "initial state components",
                            got: component.shape().to_vec(),
                            expected: vec![b, h],
                        });
                    }
                }
                init.to_vec()
            }
            None => self.pool.acquire_zeroed_state(n, (b, h)).to_vec(),
        };
        let context = self.pool.acquire_context((b, len, h));

        for t in 0..len {
            let (input, tcache) = self.transform.forward(batch.source_input(t))?;
            let (mut next, ccache) = self.cell.step(&state, input.view())?;

            if let Some(sizes) = batch.source_sizes() {
                zero_padded_rows(&mut next, sizes, len, t);
            }
            context.slice_mut(s![.., t, ..]).assign(&next[n - 1]);

            let prev = std::mem::replace(&mut state, next);
            if self.training {
                self.retained.push(StepRecord {
                    state: prev,
                    input,
                    cell: ccache,
                    transform: tcache,
                });
            }
        }

        if self.training {
            self.retained_batch = Some((b, len));
        }
        self.final_state = state;

        Ok(Encoded {
            context: self.pool.context(),
            state: &self.final_state,
        })
    }

    /// `backward_from` with no gradient on the final state.
    pub fn backward(
        &mut self,
        batch: &Batch,
        grad_context: &Array3<f32>,
    ) -> Result<Vec<Array2<f32>>> {
        self.backward_from(batch, grad_context, None)
    }

    /// Replays the retained unroll in reverse, accumulating parameter
    /// gradients into the cell and the transform, and returning the
    /// per-step gradient on the transform's output, ordered by step.
    ///
    /// `grad_context` is the loss gradient with respect to the context,
    /// `[batch, source_length, hidden]`; `grad_final_state`, if given, seeds
    /// the carried state gradient. Per step the ordering mirrors forward
    /// exactly: inject the context gradient into the top output component,
    /// zero the padded rows, then run the cell's reverse step. The retained
    /// pass is consumed; a second call needs a new forward.
    pub fn backward_from(
        &mut self,
        batch: &Batch,
        grad_context: &Array3<f32>,
        grad_final_state: Option<&[Array2<f32>]>,
    ) -> Result<Vec<Array2<f32>>> {
        let expected = self.retained_batch.take().ok_or(EncoderErr::NoRetainedSteps)?;
        let got = (batch.size(), batch.source_length());
        if got != expected {
            return Err(EncoderErr::StaleBatch { got, expected });
        }

        let (b, len) = got;
        let (n, h) = (self.cell.num_states(), self.cell.hidden_size());
        if grad_context.dim() != (b, len, h) {
            return Err(EncoderErr::ShapeMismatch {
                what: "context gradient",
                got: grad_context.shape().to_vec(),
                expected: vec![b, len, h],
            });
        }
        debug!("backward: {b} x {len}");

        let mut grad = match grad_final_state {
            Some(seed) => {
                if seed.len() != n {
                    return Err(EncoderErr::ArityMismatch {
                        what: "final state gradients",
                        got: seed.len(),
                        expected: n,
                    });
                }
                for component in seed {
                    if component.dim() != (b, h) {
                        return Err(EncoderErr::ShapeMismatch {
                            what: "final state gradients",
                            got: component.shape().to_vec(),
                            expected: vec![b, h],
                        });
                    }
                }
                seed.to_vec()
            }
            None => self.pool.acquire_zeroed_grad_state(n, (b, h)).to_vec(),
        };
        let steps = std::mem::take(&mut self.retained);
        let mut per_step = Vec::with_capacity(len);

        for (t, record) in steps.into_iter().enumerate().rev() {
            grad[n - 1] += &grad_context.slice(s![.., t, ..]);
            if let Some(sizes) = batch.source_sizes() {
                zero_padded_rows(&mut grad, sizes, len, t);
            }

            let (grad_state, grad_input) =
                self.cell
                    .step_backward(&record.state, record.input.view(), &record.cell, &grad)?;
            self.transform.backward(&record.transform, &grad_input)?;
            per_step.push(grad_input);
            grad = grad_state;
        }

        per_step.reverse();
        Ok(per_step)
    }

    /// Advances the cell by a single step outside any unroll, returning the
    /// next state borrowed from the encoder. Nothing is retained and any
    /// retained pass from an earlier forward is discarded; this path is for
    /// incremental decoding and never feeds `backward`.
    pub fn forward_one_step(
        &mut self,
        state: &[Array2<f32>],
        tokens: ArrayView1<usize>,
    ) -> Result<&[Array2<f32>]> {
        let batch = tokens.len();
        self.retained.clear();
        self.retained_batch = None;
        self.cell.begin_forward(batch, self.training)?;
        self.transform.begin_forward(self.training);

        let (input, _) = self.transform.forward(tokens)?;
        let (next, _) = self.cell.step(state, input.view())?;
        self.final_state = next;

        Ok(&self.final_state)
    }

    /// `forward_one_step` for callers that need the state to outlive the
    /// encoder's buffers.
    pub fn forward_one_step_cloned(
        &mut self,
        state: &[Array2<f32>],
        tokens: ArrayView1<usize>,
    ) -> Result<Vec<Array2<f32>>> {
        Ok(self.forward_one_step(state, tokens)?.to_vec())
    }

    /// A fresh all-zero state for `forward_one_step`, owned by the caller.
    pub fn initial_state(&self, batch: usize) -> Vec<Array2<f32>> {
        vec![Array2::zeros((batch, self.cell.hidden_size())); self.cell.num_states()]
    }

    pub fn zero_grad(&mut self) {
        self.cell.zero_grad();
        self.transform.zero_grad();
    }
}
