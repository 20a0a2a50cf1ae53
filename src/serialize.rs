use serde::{Deserialize, Serialize};

use crate::cells::{Cell, RecurrentCell};
use crate::config::{CellType, DropoutMode};
use crate::encoder::Encoder;
use crate::transform::{Embedding, InputTransform};
use crate::{EncoderErr, Result};

/// The constructor arguments persisted alongside the module weights, used to
/// cross-check a save before rebuilding from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedArgs {
    pub hidden_size: usize,
    pub cell_type: CellType,
    /// Total state components of the cell. Older saves wrote this field as
    /// `effective_layers`; the alias keeps them loadable.
    #[serde(alias = "effective_layers")]
    pub num_states: usize,
    pub dropout_mode: DropoutMode,
    pub vocab_size: usize,
    pub embed_size: usize,
}

#[derive(Serialize, Deserialize)]
pub struct SavedModules {
    pub cell: Cell,
    pub transform: Embedding,
}

/// A self-describing, JSON-serializable snapshot of an encoder.
///
/// Gradient accumulators, dropout state and the retained unroll are not part
/// of a save; a loaded encoder starts in evaluation mode with zeroed
/// gradients.
#[derive(Serialize, Deserialize)]
pub struct SavedEncoder {
    pub args: SavedArgs,
    pub modules: SavedModules,
}

impl SavedEncoder {
    pub fn from_encoder(encoder: &Encoder<Cell, Embedding>) -> Self {
        let cell = encoder.cell();
        let transform = encoder.transform();

        Self {
            args: SavedArgs {
                hidden_size: cell.hidden_size(),
                cell_type: cell.cell_type(),
                num_states: cell.num_states(),
                dropout_mode: cell.dropout_mode(),
                vocab_size: transform.vocab_size(),
                embed_size: transform.output_size(),
            },
            modules: SavedModules {
                cell: cell.clone(),
                transform: transform.clone(),
            },
        }
    }

    /// Rebuilds a working encoder, verifying that the declared args and the
    /// saved modules agree.
    pub fn into_encoder(self) -> Result<Encoder<Cell, Embedding>> {
        let checks = [
            ("num_states", self.args.num_states, self.modules.cell.num_states()),
            (
                "hidden_size",
                self.args.hidden_size,
                self.modules.cell.hidden_size(),
            ),
            (
                "vocab_size",
                self.args.vocab_size,
                self.modules.transform.vocab_size(),
            ),
            (
                "embed_size",
                self.args.embed_size,
                self.modules.transform.output_size(),
            ),
        ];
        for (what, got, expected) in checks {
            if got != expected {
                return Err(EncoderErr::InconsistentSave {
                    what,
                    got,
                    expected,
                });
            }
        }
        if self.args.cell_type != self.modules.cell.cell_type() {
            return Err(EncoderErr::Persist(format!(
                "the persisted args declare a {:?} cell but the saved modules hold a {:?}",
                self.args.cell_type,
                self.modules.cell.cell_type()
            )));
        }
        if self.args.dropout_mode != self.modules.cell.dropout_mode() {
            return Err(EncoderErr::Persist(format!(
                "the persisted args declare {:?} dropout but the saved modules use {:?}",
                self.args.dropout_mode,
                self.modules.cell.dropout_mode()
            )));
        }

        let mut encoder = Encoder::new(self.modules.cell, self.modules.transform)?;
        // Serde skips gradient buffers; rebuild them at the right shapes.
        encoder.zero_grad();
        Ok(encoder)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EncoderErr::Persist(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| EncoderErr::Persist(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::config::EncoderConfig;
    use ndarray::array;

    fn encoder(cell_type: CellType) -> Encoder<Cell, Embedding> {
        let mut cfg = EncoderConfig::new(2, 4, cell_type);
        cfg.dropout = 0.25;
        cfg.build(10, 3, 42).unwrap()
    }

    #[test]
    fn round_trip_preserves_behavior() {
        for cell_type in [CellType::Lstm, CellType::Gru] {
            let mut enc = encoder(cell_type);
            let batch = Batch::new(array![[1, 2, 3], [4, 5, 6]]);
            let want = enc.forward(&batch).unwrap().context.clone();

            let json = SavedEncoder::from_encoder(&enc).to_json().unwrap();
            let mut loaded = SavedEncoder::from_json(&json).unwrap().into_encoder().unwrap();

            assert!(!loaded.is_training());
            let got = loaded.forward(&batch).unwrap().context.clone();
            assert_eq!(got, want);
        }
    }

    #[test]
    fn args_record_the_state_arity() {
        let saved = SavedEncoder::from_encoder(&encoder(CellType::Lstm));
        assert_eq!(saved.args.num_states, 4);
        assert_eq!(saved.args.cell_type, CellType::Lstm);

        let saved = SavedEncoder::from_encoder(&encoder(CellType::Gru));
        assert_eq!(saved.args.num_states, 2);
    }

    #[test]
    fn accepts_the_legacy_field_name() {
        let mut saved = SavedEncoder::from_encoder(&encoder(CellType::Gru));
        saved.args.num_states = 0; // overwritten below

        let json = saved.to_json().unwrap();
        let legacy = json.replacen("\"num_states\":0", "\"effective_layers\":2", 1);
        assert_ne!(legacy, json);

        let reloaded = SavedEncoder::from_json(&legacy).unwrap();
        assert_eq!(reloaded.args.num_states, 2);
        assert!(reloaded.into_encoder().is_ok());
    }

    #[test]
    fn rejects_tampered_args() {
        let mut saved = SavedEncoder::from_encoder(&encoder(CellType::Lstm));
        saved.args.num_states = 7;

        assert!(matches!(
            saved.into_encoder(),
            Err(EncoderErr::InconsistentSave {
                what: "num_states",
                got: 7,
                expected: 4,
            })
        ));
    }

    #[test]
    fn loaded_encoder_can_train() {
        let enc = encoder(CellType::Lstm);
        let json = SavedEncoder::from_encoder(&enc).to_json().unwrap();
        drop(enc);

        let mut loaded = SavedEncoder::from_json(&json).unwrap().into_encoder().unwrap();
        loaded.set_train(true);

        let batch = Batch::new(array![[1, 2], [3, 4]]);
        loaded.forward(&batch).unwrap();
        let grad = ndarray::Array3::from_elem((2, 2, 4), 1.0);
        loaded.backward(&batch, &grad).unwrap();
        assert!(loaded.transform().grad().iter().any(|&v| v != 0.0));
    }
}
