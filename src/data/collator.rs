//! Causal-LM batch collation onto pipeline stages.

use crate::distributed::{Batch, FieldSpec, PlaceholderRouter};
use crate::utils::error::{MeshError, Result};
use candle_core::{DType, Tensor};

pub const INPUT_IDS: &str = "input_ids";
pub const INPUT_MASK: &str = "input_mask";
pub const LABEL_IDS: &str = "label_ids";
pub const LABEL_MASK: &str = "label_mask";

/// Turns rows of `sequence_length + 1` tokens into shifted inputs and labels.
///
/// Inputs live on the first pipeline stage that embeds tokens, labels on the
/// stage computing the loss.
#[derive(Debug, Clone, Copy)]
pub struct ClmCollator {
    pub sequence_length: usize,
    pub input_pp_rank: usize,
    pub output_pp_rank: usize,
}

impl ClmCollator {
    pub fn new(sequence_length: usize, input_pp_rank: usize, output_pp_rank: usize) -> Self {
        Self {
            sequence_length,
            input_pp_rank,
            output_pp_rank,
        }
    }

    pub fn fields(&self) -> [FieldSpec; 4] {
        [
            FieldSpec::new(INPUT_IDS, self.input_pp_rank),
            FieldSpec::new(INPUT_MASK, self.input_pp_rank),
            FieldSpec::new(LABEL_IDS, self.output_pp_rank),
            FieldSpec::new(LABEL_MASK, self.output_pp_rank),
        ]
    }

    /// Collate `tokens` of shape `(batch, sequence_length + 1)`.
    ///
    /// Stages that own none of the fields may pass `None`.
    pub fn collate(&self, router: &PlaceholderRouter, tokens: Option<&Tensor>) -> Result<Batch> {
        let needs_tokens = router.owns(self.input_pp_rank)? || router.owns(self.output_pp_rank)?;
        if !needs_tokens {
            return router.route_batch(&self.fields(), |name| {
                Err(MeshError::Coordination(format!(
                    "pipeline rank {} produced `{}` it does not own",
                    router.pp_rank(),
                    name
                )))
            });
        }

        let tokens = tokens.ok_or_else(|| {
            MeshError::Config(format!(
                "pipeline rank {} owns batch fields but received no tokens",
                router.pp_rank()
            ))
        })?;
        let (batch_size, row_length) = tokens.dims2()?;
        if row_length != self.sequence_length + 1 {
            return Err(MeshError::Config(format!(
                "token rows have length {}, expected sequence_length + 1 = {}",
                row_length,
                self.sequence_length + 1
            )));
        }

        let seq = self.sequence_length;
        router.route_batch(&self.fields(), |name| {
            let field = match name {
                INPUT_IDS => tokens.narrow(1, 0, seq)?,
                LABEL_IDS => tokens.narrow(1, 1, seq)?,
                _ => Tensor::ones((batch_size, seq), DType::U8, tokens.device())?,
            };
            Ok(field)
        })
    }
}
