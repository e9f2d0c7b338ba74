use crate::beam::Beam;

/// A decoded token sequence with its accumulated log-probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<u32>,
    pub score: f32,
}

/// Collects the `n_best` best hypotheses of every beam, best first. The outer
/// vector follows the order of `beams`.
pub fn extract_hypotheses(beams: &[Beam], n_best: usize) -> Vec<Vec<Hypothesis>> {
    beams
        .iter()
        .map(|beam| {
            let (scores, slots) = beam.sort_scores();
            scores
                .into_iter()
                .zip(slots)
                .take(n_best)
                .map(|(score, slot)| Hypothesis {
                    tokens: beam.trace_back(slot),
                    score,
                })
                .collect()
        })
        .collect()
}

/// Splits hypotheses into separate token and score lists.
pub fn split_hypotheses(hyps: Vec<Vec<Hypothesis>>) -> (Vec<Vec<Vec<u32>>>, Vec<Vec<f32>>) {
    hyps.into_iter()
        .map(|inst| -> (Vec<Vec<u32>>, Vec<f32>) {
            inst.into_iter().map(|h| (h.tokens, h.score)).unzip()
        })
        .unzip()
}
