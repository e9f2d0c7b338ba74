use candle::{DType, Device, Tensor};
use candle_beam::{
    split_hypotheses, BeamSearchConfig, BeamSearchDecoder, Error, ModelStage, Result,
    Seq2SeqModel,
};

const EOS: u32 = 3;
const VOCAB: usize = 8;

type Script = Box<dyn Fn(u32, &[u32]) -> Vec<f32>>;

/// A fake encoder-decoder: the encoder output carries the first source token
/// of each instance as a tag, and the next-token logits of every decoder row
/// come from `script(tag, partial_sequence)`. A misaligned physical batch
/// hands rows the wrong tag and changes the decoded tokens.
struct ScriptedModel {
    script: Script,
    decoder_tags: Vec<Vec<u32>>,
    fail_at: Option<ModelStage>,
}

impl ScriptedModel {
    fn new(script: impl Fn(u32, &[u32]) -> Vec<f32> + 'static) -> Self {
        Self {
            script: Box::new(script),
            decoder_tags: vec![],
            fail_at: None,
        }
    }
}

impl Seq2SeqModel for ScriptedModel {
    fn encode(&mut self, src_seq: &Tensor, _src_pos: &Tensor) -> candle::Result<Tensor> {
        if self.fail_at == Some(ModelStage::Encode) {
            candle::bail!("encoder exploded")
        }
        src_seq.to_dtype(DType::F32)?.unsqueeze(2)
    }

    fn decode(
        &mut self,
        tgt_seq: &Tensor,
        tgt_pos: &Tensor,
        src_pos: &Tensor,
        enc_output: &Tensor,
    ) -> candle::Result<Tensor> {
        if self.fail_at == Some(ModelStage::Decode) {
            candle::bail!("decoder exploded")
        }
        let (rows, len) = tgt_seq.dims2()?;
        assert_eq!(tgt_pos.dims(), [rows, len]);
        assert_eq!(src_pos.dim(0)?, rows);
        assert_eq!(
            tgt_pos.get(0)?.to_vec1::<u32>()?,
            (1..=len as u32).collect::<Vec<_>>()
        );

        let tags: Vec<u32> = enc_output
            .narrow(1, 0, 1)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|t| t as u32)
            .collect();
        let seqs = tgt_seq.to_vec2::<u32>()?;
        let mut logits = Vec::with_capacity(rows * VOCAB);
        for (&tag, seq) in tags.iter().zip(seqs.iter()) {
            logits.extend((self.script)(tag, seq.as_slice()));
        }
        self.decoder_tags.push(tags);
        Tensor::from_vec(logits, (rows, VOCAB), tgt_seq.device())?
            .unsqueeze(1)?
            .repeat((1, len, 1))
    }

    fn project(&mut self, hidden: &Tensor) -> candle::Result<Tensor> {
        if self.fail_at == Some(ModelStage::Project) {
            candle::bail!("projection exploded")
        }
        Ok(hidden.clone())
    }
}

/// Logits of -10 everywhere except for the listed tokens.
fn logits(prefs: &[(u32, f32)]) -> Vec<f32> {
    let mut row = vec![-10f32; VOCAB];
    for &(tok, v) in prefs {
        row[tok as usize] = v;
    }
    row
}

fn log_softmax_at(row: &[f32], idx: usize) -> f32 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let lse = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
    row[idx] - lse
}

fn decoder(
    model: ScriptedModel,
    beam_size: usize,
    n_best: usize,
) -> Result<BeamSearchDecoder<ScriptedModel>> {
    let config = BeamSearchConfig::new(beam_size, n_best)?;
    BeamSearchDecoder::new(model, config, &Device::Cpu)
}

#[test]
fn width_one_is_greedy() -> Result<()> {
    let script = |_tag: u32, seq: &[u32]| {
        let len = seq.len();
        if len >= 5 {
            logits(&[(EOS, 1.0), (4, 0.5)])
        } else {
            logits(&[(4 + (len % 3) as u32, 1.0), (EOS, 0.2)])
        }
    };
    let mut dec = decoder(ScriptedModel::new(script), 1, 1)?;
    let hyps = dec.decode_sequences(&[vec![11, 12, 13]])?;
    assert_eq!(dec.last_decoder_calls(), 5);
    assert_eq!(hyps.len(), 1);
    assert_eq!(hyps[0].len(), 1);
    assert_eq!(hyps[0][0].tokens, [5, 6, 4, 5, EOS]);

    let mut expected = 0f32;
    let mut prefix = vec![2u32];
    for &tok in hyps[0][0].tokens.iter() {
        expected += log_softmax_at(&script(11, prefix.as_slice()), tok as usize);
        prefix.push(tok);
    }
    assert!((hyps[0][0].score - expected).abs() < 1e-4);
    Ok(())
}

#[test]
fn finished_instances_leave_the_batch() -> Result<()> {
    // Instance tagged 10 ends at step 3, instance tagged 20 at step 7.
    let script = |tag: u32, seq: &[u32]| {
        let end_len = if tag == 10 { 3 } else { 7 };
        if seq.len() >= end_len {
            logits(&[(EOS, 0.0), (4, -2.3)])
        } else {
            logits(&[(4, 0.0), (5, -1.5), (6, -3.7)])
        }
    };
    let mut dec = decoder(ScriptedModel::new(script), 3, 2)?;
    let hyps = dec.decode_sequences(&[vec![10, 7, 7], vec![20, 7]])?;

    assert_eq!(dec.last_decoder_calls(), 7);
    let tags = &dec.model().decoder_tags;
    for call in tags.iter().take(3) {
        assert_eq!(call, &[10, 10, 10, 20, 20, 20]);
    }
    for call in tags.iter().skip(3) {
        assert_eq!(call, &[20, 20, 20]);
    }

    assert_eq!(hyps.len(), 2);
    assert!(hyps.iter().all(|h| h.len() == 2));
    assert_eq!(hyps[0][0].tokens, [4, 4, EOS]);
    assert_eq!(hyps[1][0].tokens, [4, 4, 4, 4, 4, 4, EOS]);
    // The runner-up of the first instance also terminates at step 3.
    assert_eq!(hyps[0][1].tokens.len(), 3);
    assert_eq!(hyps[0][1].tokens[2], EOS);
    for inst in hyps.iter() {
        assert!(inst[0].score >= inst[1].score);
    }
    Ok(())
}

#[test]
fn step_cap_force_terminates() -> Result<()> {
    let script = |_tag: u32, _seq: &[u32]| logits(&[(4, 0.0), (5, -1.0), (EOS, -2.0)]);
    let mut dec = decoder(ScriptedModel::new(script), 2, 1)?;
    assert_eq!(dec.config().max_steps, 100);
    let hyps = dec.decode_sequences(&[vec![9]])?;
    assert_eq!(dec.last_decoder_calls(), 100);
    assert_eq!(hyps[0][0].tokens.len(), 100);
    assert!(hyps[0][0].tokens.iter().all(|&t| t == 4));

    let config = BeamSearchConfig::new(2, 2)?.with_max_steps(4);
    let mut dec = BeamSearchDecoder::new(ScriptedModel::new(script), config, &Device::Cpu)?;
    let hyps = dec.decode_sequences(&[vec![9], vec![9, 9]])?;
    assert_eq!(dec.last_decoder_calls(), 4);
    for inst in hyps.iter() {
        assert_eq!(inst.len(), 2);
        assert_eq!(inst[0].tokens, [4, 4, 4, 4]);
    }
    Ok(())
}

#[test]
fn all_done_after_first_step() -> Result<()> {
    let script = |_tag: u32, _seq: &[u32]| logits(&[(EOS, 0.0), (4, -1.0), (5, -2.0)]);
    let mut dec = decoder(ScriptedModel::new(script), 3, 3)?;
    let hyps = dec.decode_sequences(&[vec![4], vec![5], vec![6]])?;
    assert_eq!(dec.last_decoder_calls(), 1);
    assert_eq!(dec.model().decoder_tags.len(), 1);
    for inst in hyps.iter() {
        let tokens: Vec<_> = inst.iter().map(|h| h.tokens.clone()).collect();
        assert_eq!(tokens, [vec![EOS], vec![4], vec![5]]);
    }
    Ok(())
}

#[test]
fn split_into_tokens_and_scores() -> Result<()> {
    let script = |_tag: u32, _seq: &[u32]| logits(&[(EOS, 0.0), (4, -1.0)]);
    let mut dec = decoder(ScriptedModel::new(script), 2, 2)?;
    let hyps = dec.decode_sequences(&[vec![4], vec![5]])?;
    let (tokens, scores) = split_hypotheses(hyps.clone());
    assert_eq!(tokens.len(), 2);
    assert_eq!(scores.len(), 2);
    for (i, inst) in hyps.iter().enumerate() {
        for (j, h) in inst.iter().enumerate() {
            assert_eq!(tokens[i][j], h.tokens);
            assert_eq!(scores[i][j], h.score);
        }
    }
    Ok(())
}

#[test]
fn model_failures_abort_the_batch() -> Result<()> {
    for (stage, calls) in [
        (ModelStage::Encode, 0),
        (ModelStage::Decode, 1),
        (ModelStage::Project, 1),
    ] {
        let mut model = ScriptedModel::new(|_, _| logits(&[]));
        model.fail_at = Some(stage);
        let mut dec = decoder(model, 2, 1)?;
        let err = dec.decode_sequences(&[vec![4], vec![5]]);
        match err {
            Err(Error::ModelInvocation { stage: got, .. }) => assert_eq!(got, stage),
            other => panic!("expected a {stage} failure, got {other:?}"),
        }
        assert_eq!(dec.last_decoder_calls(), calls);
    }
    Ok(())
}

#[test]
fn invalid_configs_are_rejected() {
    let config = BeamSearchConfig {
        beam_size: 2,
        n_best: 3,
        max_steps: 10,
        bos_token_id: 2,
        eos_token_id: EOS,
        pad_token_id: 0,
    };
    let model = ScriptedModel::new(|_, _| logits(&[]));
    let dec = BeamSearchDecoder::new(model, config, &Device::Cpu);
    assert!(matches!(dec, Err(Error::Config(_))));
}

#[test]
fn empty_and_malformed_batches() -> Result<()> {
    let mut dec = decoder(ScriptedModel::new(|_, _| logits(&[])), 2, 1)?;
    assert!(dec.decode_sequences(&[])?.is_empty());
    assert_eq!(dec.last_decoder_calls(), 0);

    let src = Tensor::new(&[1u32, 2, 3], &Device::Cpu)?;
    let err = dec.decode_batch(&src, &src);
    assert!(matches!(err, Err(Error::UnexpectedShape { .. })));

    let src = Tensor::new(&[[4u32, 5]], &Device::Cpu)?;
    let pos = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
    let err = dec.decode_batch(&src, &pos);
    assert!(matches!(err, Err(Error::UnexpectedShape { .. })));
    Ok(())
}
