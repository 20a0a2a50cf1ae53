pub mod batch;
pub mod cells;
pub mod config;
pub mod encoder;
pub mod error;
pub mod mask;
pub mod pool;
pub mod serialize;
pub mod transform;

pub use error::{EncoderErr, Result};
