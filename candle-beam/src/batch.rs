//! Bookkeeping between logical instances and the compacted physical batch.
//!
//! Each live instance occupies `beam_size` contiguous rows of the physical
//! batch. When instances finish, their rows are dropped and the remaining
//! blocks are packed together in their original order.
use candle::Tensor;

use crate::error::{Error, Result};

/// Bijection between the still-active logical instances and the physical
/// slots `0..len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveInstances {
    /// Logical instance for each physical slot, in increasing order.
    logical: Vec<usize>,
    /// Physical slot for each logical instance of the original batch.
    slots: Vec<Option<usize>>,
}

impl ActiveInstances {
    /// The identity map over `0..batch_size`.
    pub fn new(batch_size: usize) -> Self {
        Self {
            logical: (0..batch_size).collect(),
            slots: (0..batch_size).map(Some).collect(),
        }
    }

    /// Number of active instances, i.e. of physical slots.
    pub fn len(&self) -> usize {
        self.logical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logical.is_empty()
    }

    /// Size of the original batch.
    pub fn batch_size(&self) -> usize {
        self.slots.len()
    }

    pub fn logical_ids(&self) -> &[usize] {
        &self.logical
    }

    pub fn slot(&self, logical: usize) -> Option<usize> {
        self.slots.get(logical).copied().flatten()
    }

    pub fn logical(&self, slot: usize) -> Option<usize> {
        self.logical.get(slot).copied()
    }

    /// Iterates over `(slot, logical)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.logical.iter().copied().enumerate()
    }

    /// Current physical slots of the given logical instances.
    pub fn slots_of(&self, logical: &[usize]) -> Result<Vec<usize>> {
        logical
            .iter()
            .map(|&l| {
                self.slot(l)
                    .ok_or(Error::InvalidActiveSet { logical: l })
            })
            .collect()
    }

    /// Builds the map for the next step, keeping only `still_active`.
    ///
    /// `still_active` must list currently active instances in their current
    /// order; the new slot of each instance is its position in that list.
    pub fn retain(&self, still_active: &[usize]) -> Result<Self> {
        let mut slots = vec![None; self.batch_size()];
        let mut last_slot = None;
        for (new_slot, &logical) in still_active.iter().enumerate() {
            let old_slot = self
                .slot(logical)
                .ok_or(Error::InvalidActiveSet { logical })?;
            if last_slot.is_some_and(|last| old_slot <= last) {
                return Err(Error::InvalidActiveSet { logical });
            }
            last_slot = Some(old_slot);
            slots[logical] = Some(new_slot);
        }
        Ok(Self {
            logical: still_active.to_vec(),
            slots,
        })
    }
}

/// Repeats every row of `xs` `beam_size` times along the first dimension so
/// that each instance gets a contiguous block of `beam_size` rows.
pub fn replicate_rows(xs: &Tensor, beam_size: usize) -> Result<Tensor> {
    let dims = xs.dims();
    let Some((&n, rest)) = dims.split_first() else {
        return Err(Error::UnexpectedShape {
            op: "replicate-rows",
            expected: "at least one dimension".to_string(),
            got: dims.to_vec(),
        });
    };
    let mut expanded = vec![n, beam_size];
    expanded.extend_from_slice(rest);
    let mut flat = vec![n * beam_size];
    flat.extend_from_slice(rest);
    let xs = xs
        .unsqueeze(1)?
        .broadcast_as(expanded)?
        .contiguous()?
        .reshape(flat)?;
    Ok(xs)
}

/// Keeps the row blocks of the instances at `active_slots`, in that order.
///
/// `xs` must hold exactly `n_prev * beam_size` rows. The result holds
/// `active_slots.len() * beam_size` rows, anything else is an integrity error.
pub fn compact_rows(
    xs: &Tensor,
    active_slots: &[usize],
    n_prev: usize,
    beam_size: usize,
) -> Result<Tensor> {
    let rows = xs.dim(0)?;
    if rows != n_prev * beam_size {
        return Err(Error::IndexIntegrity {
            op: "compact-rows",
            expected: n_prev * beam_size,
            got: rows,
        });
    }
    let mut ids = Vec::with_capacity(active_slots.len() * beam_size);
    for &slot in active_slots {
        if slot >= n_prev {
            return Err(Error::IndexIntegrity {
                op: "compact-rows",
                expected: rows,
                got: (slot + 1) * beam_size,
            });
        }
        ids.extend((slot * beam_size..(slot + 1) * beam_size).map(|r| r as u32));
    }
    let n_ids = ids.len();
    let ids = Tensor::from_vec(ids, n_ids, xs.device())?;
    let compacted = xs.index_select(&ids, 0)?;
    let got = compacted.dim(0)?;
    if got != active_slots.len() * beam_size {
        return Err(Error::IndexIntegrity {
            op: "compact-rows",
            expected: active_slots.len() * beam_size,
            got,
        });
    }
    Ok(compacted)
}

/// Encoder output and source positions laid out on the physical batch.
///
/// The buffers are never mutated: compaction produces a new context.
#[derive(Debug, Clone)]
pub struct SourceContext {
    enc_output: Tensor,
    src_pos: Tensor,
    n_instances: usize,
    beam_size: usize,
}

impl SourceContext {
    /// Replicates the per-instance encoder output and source positions
    /// `beam_size` times.
    pub fn new(enc_output: &Tensor, src_pos: &Tensor, beam_size: usize) -> Result<Self> {
        let n_instances = src_pos.dim(0)?;
        let enc_rows = enc_output.dim(0)?;
        if enc_rows != n_instances {
            return Err(Error::UnexpectedShape {
                op: "source-context",
                expected: format!("{n_instances} encoder rows"),
                got: enc_output.dims().to_vec(),
            });
        }
        Ok(Self {
            enc_output: replicate_rows(enc_output, beam_size)?,
            src_pos: replicate_rows(src_pos, beam_size)?,
            n_instances,
            beam_size,
        })
    }

    pub fn enc_output(&self) -> &Tensor {
        &self.enc_output
    }

    pub fn src_pos(&self) -> &Tensor {
        &self.src_pos
    }

    pub fn n_instances(&self) -> usize {
        self.n_instances
    }

    pub fn beam_size(&self) -> usize {
        self.beam_size
    }

    /// Physical row count, `n_instances * beam_size`.
    pub fn rows(&self) -> usize {
        self.n_instances * self.beam_size
    }

    /// Drops the rows of every instance whose slot is not in `active_slots`.
    pub fn retain(&self, active_slots: &[usize]) -> Result<Self> {
        let enc_output =
            compact_rows(&self.enc_output, active_slots, self.n_instances, self.beam_size)?;
        let src_pos = compact_rows(&self.src_pos, active_slots, self.n_instances, self.beam_size)?;
        Ok(Self {
            enc_output,
            src_pos,
            n_instances: active_slots.len(),
            beam_size: self.beam_size,
        })
    }
}
