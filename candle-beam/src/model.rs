use candle::{Result, Tensor};

/// An encoder-decoder network driven by the beam search.
///
/// Methods take `&mut self` so that implementations can keep caches between
/// calls. Errors are reported as plain candle errors, the search wraps them
/// with the stage that failed.
pub trait Seq2SeqModel {
    /// Encodes the source batch.
    ///
    /// * `src_seq` - source token ids `(batch, src_len)`
    /// * `src_pos` - source positions `(batch, src_len)`, 0 on padding
    ///
    /// Returns the encoder output `(batch, src_len, d_model)`. Called once per
    /// decoded batch.
    fn encode(&mut self, src_seq: &Tensor, src_pos: &Tensor) -> Result<Tensor>;

    /// Runs the decoder on the partial target sequences of the physical batch.
    ///
    /// * `tgt_seq` - partial sequences `(rows, tgt_len)`
    /// * `tgt_pos` - target positions `(rows, tgt_len)`, `1..=tgt_len`
    /// * `src_pos` - source positions `(rows, src_len)`
    /// * `enc_output` - encoder output `(rows, src_len, d_model)`
    ///
    /// Returns the hidden states `(rows, tgt_len, d_model)`.
    fn decode(
        &mut self,
        tgt_seq: &Tensor,
        tgt_pos: &Tensor,
        src_pos: &Tensor,
        enc_output: &Tensor,
    ) -> Result<Tensor>;

    /// Maps decoder hidden states `(rows, d_model)` to unnormalized logits
    /// `(rows, vocab_size)`.
    fn project(&mut self, hidden: &Tensor) -> Result<Tensor>;
}

impl<M: Seq2SeqModel + ?Sized> Seq2SeqModel for Box<M> {
    fn encode(&mut self, src_seq: &Tensor, src_pos: &Tensor) -> Result<Tensor> {
        (**self).encode(src_seq, src_pos)
    }

    fn decode(
        &mut self,
        tgt_seq: &Tensor,
        tgt_pos: &Tensor,
        src_pos: &Tensor,
        enc_output: &Tensor,
    ) -> Result<Tensor> {
        (**self).decode(tgt_seq, tgt_pos, src_pos, enc_output)
    }

    fn project(&mut self, hidden: &Tensor) -> Result<Tensor> {
        (**self).project(hidden)
    }
}
