use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire crate.
pub type Result<T> = std::result::Result<T, EncoderErr>;

/// The encoder's error type.
///
/// Variants fall into three classes: configuration errors (detected at
/// construction time, before any tensor work), shape mismatches (detected at
/// the start of a forward/backward call) and sequencing errors (backward
/// invoked without a matching forward). None of these are transient; a failed
/// call leaves the encoder's buffers in an unspecified state and the caller
/// must not reuse their contents.
#[derive(Debug)]
pub enum EncoderErr {
    InvalidRate {
        what: &'static str,
        rate: f32,
    },
    ZeroDim {
        what: &'static str,
    },
    UnknownCellType(String),
    UnknownDropoutMode(String),
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    ArityMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    TokenOutOfRange {
        token: usize,
        vocab: usize,
    },
    BadSourceSize {
        sample: usize,
        size: usize,
        max: usize,
    },
    NoRetainedSteps,
    StaleBatch {
        got: (usize, usize),
        expected: (usize, usize),
    },
    CacheMismatch,
    InconsistentSave {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Persist(String),
}

impl Display for EncoderErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncoderErr::InvalidRate { what, rate } => {
                format!("The {what} rate {rate} is outside the valid range [0, 1]")
            }
            EncoderErr::ZeroDim { what } => {
                format!("The {what} must be a positive integer")
            }
            EncoderErr::UnknownCellType(name) => {
                format!("Unknown cell type {name:?}, expected \"lstm\" or \"gru\"")
            }
            EncoderErr::UnknownDropoutMode(name) => {
                format!("Unknown dropout mode {name:?}, expected \"naive\" or \"variational\"")
            }
            EncoderErr::ShapeMismatch {
                what,
                got,
                expected,
            } => {
                format!("There's a shape mismatch on {what}, got {got:?} and expected {expected:?}")
            }
            EncoderErr::ArityMismatch {
                what,
                got,
                expected,
            } => {
                format!("Wrong number of {what}, got {got} and expected {expected}")
            }
            EncoderErr::TokenOutOfRange { token, vocab } => {
                format!("Token id {token} is out of range for a vocabulary of {vocab}")
            }
            EncoderErr::BadSourceSize { sample, size, max } => {
                format!("Sample {sample} declares a valid length of {size}, expected 1..={max}")
            }
            EncoderErr::NoRetainedSteps => {
                "Backward was invoked without a preceding training-mode forward, \
                 the per-step inputs it needs are not retained"
                    .to_string()
            }
            EncoderErr::StaleBatch { got, expected } => {
                format!(
                    "Backward was invoked with a batch shaped {got:?} but the retained \
                     forward pass used {expected:?}"
                )
            }
            EncoderErr::CacheMismatch => {
                "The retained step cache does not belong to this cell variant".to_string()
            }
            EncoderErr::InconsistentSave {
                what,
                got,
                expected,
            } => {
                format!(
                    "The persisted args declare {what} = {got} but the saved modules \
                     imply {expected}"
                )
            }
            EncoderErr::Persist(msg) => {
                format!("Failed to (de)serialize the encoder: {msg}")
            }
        };

        write!(f, "{s}")
    }
}

impl Error for EncoderErr {}
