//! The batched beam search loop.
//!
//! The source batch is encoded once, then every step stacks the partial
//! sequences of all live beams into a single decoder call. Instances whose
//! best candidate reaches the end marker are dropped from the physical batch
//! before the next step.
use candle::{DType, Device, Tensor, D};

use crate::batch::{ActiveInstances, SourceContext};
use crate::beam::Beam;
use crate::config::BeamSearchConfig;
use crate::error::{Error, ModelStage, Result};
use crate::hypothesis::{extract_hypotheses, Hypothesis};
use crate::model::Seq2SeqModel;
use crate::source::SourceBatch;

pub struct BeamSearchDecoder<M> {
    model: M,
    config: BeamSearchConfig,
    device: Device,
    last_decoder_calls: usize,
}

impl<M: Seq2SeqModel> BeamSearchDecoder<M> {
    pub fn new(model: M, config: BeamSearchConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            model,
            config,
            device: device.clone(),
            last_decoder_calls: 0,
        })
    }

    pub fn config(&self) -> &BeamSearchConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Number of decoder invocations made by the last decoded batch.
    pub fn last_decoder_calls(&self) -> usize {
        self.last_decoder_calls
    }

    /// Pads the token sequences into a source batch and decodes it.
    pub fn decode_sequences(&mut self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<Hypothesis>>> {
        if sequences.is_empty() {
            self.last_decoder_calls = 0;
            return Ok(vec![]);
        }
        let batch =
            SourceBatch::from_sequences(sequences, self.config.pad_token_id, &self.device)?;
        self.decode_batch(&batch.src_seq, &batch.src_pos)
    }

    /// Runs the beam search on a source batch.
    ///
    /// `src_seq` and `src_pos` both have shape `(batch, src_len)`. Returns, for
    /// each instance in batch order, up to `n_best` hypotheses sorted best
    /// first. Any model failure aborts the whole batch.
    pub fn decode_batch(
        &mut self,
        src_seq: &Tensor,
        src_pos: &Tensor,
    ) -> Result<Vec<Vec<Hypothesis>>> {
        self.last_decoder_calls = 0;
        let (batch_size, _) = src_seq.dims2().map_err(|_| Error::UnexpectedShape {
            op: "decode-batch",
            expected: "(batch, src_len) source ids".to_string(),
            got: src_seq.dims().to_vec(),
        })?;
        if src_pos.dims() != src_seq.dims() {
            return Err(Error::UnexpectedShape {
                op: "decode-batch",
                expected: format!("source positions {:?}", src_seq.dims()),
                got: src_pos.dims().to_vec(),
            });
        }
        if batch_size == 0 {
            return Ok(vec![]);
        }
        let cfg = &self.config;
        let beam_size = cfg.beam_size;

        let enc_output = self
            .model
            .encode(src_seq, src_pos)
            .map_err(Error::model(ModelStage::Encode))?;
        let mut context = SourceContext::new(&enc_output, src_pos, beam_size)?;
        let mut beams: Vec<Beam> = (0..batch_size)
            .map(|_| Beam::new(beam_size, cfg.bos_token_id, cfg.eos_token_id, cfg.pad_token_id))
            .collect();
        let mut active = ActiveInstances::new(batch_size);

        for step in 1..=self.config.max_steps {
            let span = tracing::span!(tracing::Level::TRACE, "beam-step", step);
            let _enter = span.enter();

            let log_probs = self.step_log_probs(&beams, &active, &context, step)?;
            let mut still_active = Vec::with_capacity(active.len());
            for (slot, logical) in active.iter() {
                if beams[logical].advance(&log_probs.get(slot)?)? {
                    tracing::debug!(instance = logical, step, "instance finished");
                } else {
                    still_active.push(logical);
                }
            }
            if still_active.is_empty() {
                break;
            }
            if still_active.len() < active.len() {
                let slots = active.slots_of(&still_active)?;
                context = context.retain(&slots)?;
                active = active.retain(&still_active)?;
                tracing::debug!(step, remaining = active.len(), "compacted physical batch");
            }
        }

        for (_, logical) in active.iter() {
            let beam = &mut beams[logical];
            if !beam.is_done() {
                tracing::debug!(
                    instance = logical,
                    max_steps = self.config.max_steps,
                    "instance stopped at the step cap"
                );
                beam.finish();
            }
        }
        Ok(extract_hypotheses(&beams, self.config.n_best))
    }

    /// Runs the decoder on the live beams and returns the next token
    /// log-probabilities with shape `(n_active, beam_size, vocab_size)`.
    fn step_log_probs(
        &mut self,
        beams: &[Beam],
        active: &ActiveInstances,
        context: &SourceContext,
        step_len: usize,
    ) -> Result<Tensor> {
        let beam_size = self.config.beam_size;
        let rows = active.len() * beam_size;
        if context.rows() != rows {
            return Err(Error::IndexIntegrity {
                op: "source-context",
                expected: rows,
                got: context.rows(),
            });
        }

        let mut tokens = Vec::with_capacity(rows * step_len);
        for (_, logical) in active.iter() {
            for seq in beams[logical].current_state() {
                tokens.extend(seq);
            }
        }
        if tokens.len() != rows * step_len {
            return Err(Error::IndexIntegrity {
                op: "decoder-input",
                expected: rows * step_len,
                got: tokens.len(),
            });
        }
        let tgt_seq = Tensor::from_vec(tokens, (rows, step_len), &self.device)?;
        let tgt_pos = Tensor::arange(1u32, step_len as u32 + 1, &self.device)?
            .unsqueeze(0)?
            .repeat((rows, 1))?;

        self.last_decoder_calls += 1;
        let hidden = self
            .model
            .decode(&tgt_seq, &tgt_pos, context.src_pos(), context.enc_output())
            .map_err(Error::model(ModelStage::Decode))?;
        let (out_rows, out_len, _) = hidden.dims3().map_err(|_| Error::UnexpectedShape {
            op: "decoder-output",
            expected: "(rows, tgt_len, hidden)".to_string(),
            got: hidden.dims().to_vec(),
        })?;
        if out_rows != rows {
            return Err(Error::IndexIntegrity {
                op: "decoder-output",
                expected: rows,
                got: out_rows,
            });
        }
        if out_len == 0 {
            return Err(Error::UnexpectedShape {
                op: "decoder-output",
                expected: "at least one target position".to_string(),
                got: hidden.dims().to_vec(),
            });
        }
        let last = hidden.narrow(1, out_len - 1, 1)?.squeeze(1)?;

        let logits = self
            .model
            .project(&last)
            .map_err(Error::model(ModelStage::Project))?;
        let (logit_rows, vocab_size) = logits.dims2().map_err(|_| Error::UnexpectedShape {
            op: "projection-output",
            expected: "(rows, vocab_size)".to_string(),
            got: logits.dims().to_vec(),
        })?;
        if logit_rows != rows {
            return Err(Error::IndexIntegrity {
                op: "projection-output",
                expected: rows,
                got: logit_rows,
            });
        }
        let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
        Ok(log_probs.reshape((active.len(), beam_size, vocab_size))?)
    }
}
