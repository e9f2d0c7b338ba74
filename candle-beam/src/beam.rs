//! Per-instance beam state.
//!
//! A [`Beam`] keeps `width` candidate slots. Every call to [`Beam::advance`]
//! extends the candidates by one token and records, for each new slot, which
//! slot of the previous step it extended. Hypotheses are rebuilt afterwards by
//! following these backpointers from the last step to the first one.
use candle::{DType, Tensor};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Beam {
    width: usize,
    eos_token_id: u32,
    /// Accumulated log-probability of each slot.
    scores: Vec<f32>,
    /// Score vectors after each step.
    all_scores: Vec<Vec<f32>>,
    /// For each step, the slot of the previous step that each slot extended.
    prev_slots: Vec<Vec<usize>>,
    /// Tokens per step, `next_tokens[0]` holds the start markers.
    next_tokens: Vec<Vec<u32>>,
    done: bool,
}

impl Beam {
    /// Creates a beam where slot 0 starts with `bos_token_id` and the other
    /// slots with `pad_token_id`.
    pub fn new(width: usize, bos_token_id: u32, eos_token_id: u32, pad_token_id: u32) -> Self {
        let mut first = vec![pad_token_id; width];
        if let Some(slot) = first.first_mut() {
            *slot = bos_token_id;
        }
        Self {
            width,
            eos_token_id,
            scores: vec![0f32; width],
            all_scores: Vec::new(),
            prev_slots: Vec::new(),
            next_tokens: vec![first],
            done: false,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn all_scores(&self) -> &[Vec<f32>] {
        &self.all_scores
    }

    pub fn backpointers(&self) -> &[Vec<usize>] {
        &self.prev_slots
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of tokens appended so far.
    pub fn num_steps(&self) -> usize {
        self.prev_slots.len()
    }

    /// Marks the beam as finished without appending a token, used when the
    /// step cap is reached.
    pub fn finish(&mut self) {
        self.done = true;
    }

    /// The partial sequences of all slots, best first, each one starting with
    /// the start marker. All rows have length `num_steps() + 1`.
    pub fn current_state(&self) -> Vec<Vec<u32>> {
        if self.prev_slots.is_empty() {
            return self.next_tokens[0].iter().map(|&t| vec![t]).collect();
        }
        // Slots are kept in descending score order by `advance`.
        (0..self.width)
            .map(|slot| {
                let mut seq = Vec::with_capacity(self.num_steps() + 1);
                seq.push(self.next_tokens[0][0]);
                seq.extend(self.trace_back(slot));
                seq
            })
            .collect()
    }

    /// Extends the beam by one token.
    ///
    /// `log_probs` has shape `(width, vocab_size)`, row `i` being the next
    /// token distribution of slot `i`. On the first step only row 0 is used so
    /// that the search starts from a single origin rather than `width` copies
    /// of it. Returns whether the best slot now ends with the end marker.
    pub fn advance(&mut self, log_probs: &Tensor) -> Result<bool> {
        if self.done {
            return Err(Error::BeamFinished {
                steps: self.num_steps(),
            });
        }
        let (rows, vocab_size) = log_probs.dims2()?;
        if rows != self.width {
            return Err(Error::UnexpectedShape {
                op: "beam-advance",
                expected: format!("({}, vocab_size)", self.width),
                got: log_probs.dims().to_vec(),
            });
        }
        let log_probs = log_probs.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        let candidates: Vec<f32> = if self.prev_slots.is_empty() {
            log_probs[0].clone()
        } else {
            log_probs
                .iter()
                .zip(self.scores.iter())
                .flat_map(|(row, &prior)| row.iter().map(move |&lp| prior + lp))
                .collect()
        };
        if candidates.len() < self.width {
            return Err(Error::UnexpectedShape {
                op: "beam-advance",
                expected: format!("at least {} candidates", self.width),
                got: vec![candidates.len()],
            });
        }

        let best = top_k(&candidates, self.width);
        let mut prev = Vec::with_capacity(self.width);
        let mut tokens = Vec::with_capacity(self.width);
        let mut scores = Vec::with_capacity(self.width);
        for idx in best {
            prev.push(idx / vocab_size);
            tokens.push((idx % vocab_size) as u32);
            scores.push(candidates[idx]);
        }
        self.prev_slots.push(prev);
        self.next_tokens.push(tokens);
        self.all_scores.push(scores.clone());
        self.scores = scores;

        if self.next_tokens.last().and_then(|t| t.first()) == Some(&self.eos_token_id) {
            self.done = true;
        }
        Ok(self.done)
    }

    /// Final scores sorted in descending order along with their slots.
    pub fn sort_scores(&self) -> (Vec<f32>, Vec<usize>) {
        let mut slots: Vec<usize> = (0..self.scores.len()).collect();
        slots.sort_by(|&i, &j| self.scores[j].total_cmp(&self.scores[i]));
        let scores = slots.iter().map(|&i| self.scores[i]).collect();
        (scores, slots)
    }

    /// Rebuilds the tokens leading to `slot` at the last step, without the
    /// start marker. Returns `None` if `slot` is not below the beam width.
    pub fn get_hypothesis(&self, slot: usize) -> Option<Vec<u32>> {
        (slot < self.width).then(|| self.trace_back(slot))
    }

    /// Follows the backpointers from `slot`, which must be below the width.
    pub(crate) fn trace_back(&self, slot: usize) -> Vec<u32> {
        let mut slot = slot;
        let mut hyp = Vec::with_capacity(self.num_steps());
        for step in (0..self.prev_slots.len()).rev() {
            hyp.push(self.next_tokens[step + 1][slot]);
            slot = self.prev_slots[step][slot];
        }
        hyp.reverse();
        hyp
    }
}

/// Indices of the `k` largest values in descending order. Equal values are
/// ordered by increasing index.
fn top_k(values: &[f32], k: usize) -> Vec<usize> {
    if k == 0 {
        return vec![];
    }
    let cmp = |&i: &usize, &j: &usize| values[j].total_cmp(&values[i]).then(i.cmp(&j));
    let mut indices: Vec<usize> = (0..values.len()).collect();
    if k < indices.len() {
        indices.select_nth_unstable_by(k - 1, cmp);
        indices.truncate(k);
    }
    indices.sort_by(cmp);
    indices
}
