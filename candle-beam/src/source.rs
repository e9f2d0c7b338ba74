use candle::{Device, Tensor};

use crate::error::{Error, Result};

/// Padded source token ids with their positions.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub src_seq: Tensor,
    pub src_pos: Tensor,
}

impl SourceBatch {
    /// Pads `sequences` with `pad_token_id` to the longest one. Real tokens
    /// get positions starting at 1, padding gets position 0.
    pub fn from_sequences(
        sequences: &[Vec<u32>],
        pad_token_id: u32,
        device: &Device,
    ) -> Result<Self> {
        let max_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
        if max_len == 0 {
            return Err(Error::UnexpectedShape {
                op: "source-batch",
                expected: "at least one non-empty sequence".to_string(),
                got: vec![sequences.len(), 0],
            });
        }
        let batch_size = sequences.len();
        let mut ids = Vec::with_capacity(batch_size * max_len);
        let mut positions = Vec::with_capacity(batch_size * max_len);
        for seq in sequences {
            for i in 0..max_len {
                match seq.get(i) {
                    Some(&tok) if tok != pad_token_id => {
                        ids.push(tok);
                        positions.push(i as u32 + 1);
                    }
                    _ => {
                        ids.push(pad_token_id);
                        positions.push(0);
                    }
                }
            }
        }
        let src_seq = Tensor::from_vec(ids, (batch_size, max_len), device)?;
        let src_pos = Tensor::from_vec(positions, (batch_size, max_len), device)?;
        Ok(Self { src_seq, src_pos })
    }

    pub fn batch_size(&self) -> usize {
        self.src_seq.dims().first().copied().unwrap_or(0)
    }
}
