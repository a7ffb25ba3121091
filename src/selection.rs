// src/selection.rs
//
// =============================================================================
// NNPAL: DEVIATION-BASED CANDIDATE SELECTOR
// =============================================================================
//
// The ensemble disagreement on forces is the uncertainty proxy of the loop.
// Every frame of an exploration trajectory lands in exactly one band:
//
//   d <  s_low                 -> Discard     (well described)
//   s_low  <= d <  s_high      -> Candidate
//   s_high <= d <= s_high_max  -> IllDescribed (candidate, counted apart)
//   d >  s_high_max            -> Rejected    (exploded, never labeled)
//
// The share of non-discarded frames drives how long the next exploration
// iteration runs.

use crate::errors::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ============================================================================
// 1. THRESHOLDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub s_low: f64,
    pub s_high: f64,
    pub s_high_max: f64,
    pub nb_candidates_max: usize,
}

impl Thresholds {
    pub fn validate(&self) -> PipelineResult<()> {
        if !(self.s_low < self.s_high && self.s_high <= self.s_high_max) {
            return Err(PipelineError::InvalidArgument(format!(
                "deviation thresholds must satisfy s_low < s_high <= s_high_max (got {}, {}, {})",
                self.s_low, self.s_high, self.s_high_max
            )));
        }
        Ok(())
    }

    pub fn classify(&self, deviation: f64) -> Band {
        if deviation < self.s_low {
            Band::Discard
        } else if deviation < self.s_high {
            Band::Candidate
        } else if deviation <= self.s_high_max {
            Band::IllDescribed
        } else {
            Band::Rejected
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Discard,
    Candidate,
    IllDescribed,
    Rejected,
}

// ============================================================================
// 2. CANDIDATE SET
// ============================================================================

/// Selection outcome for one trajectory (`selection_candidates.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateSet {
    /// Frame indices kept for labeling, in time order.
    pub selected: Vec<usize>,
    /// Frames in `[s_low, s_high)`.
    pub nb_candidates: usize,
    /// Frames in `[s_high, s_high_max]`.
    pub nb_ill_described: usize,
    /// Frames above `s_high_max`.
    pub nb_rejected: usize,
    /// Frames below `s_low`, including the skipped equilibration frames.
    pub nb_discarded: usize,
    pub nb_total: usize,
}

impl CandidateSet {
    /// Candidates of both eligible bands before capping.
    pub fn nb_eligible(&self) -> usize {
        self.nb_candidates + self.nb_ill_described
    }

    pub fn merge(&mut self, other: &CandidateSet) {
        self.nb_candidates += other.nb_candidates;
        self.nb_ill_described += other.nb_ill_described;
        self.nb_rejected += other.nb_rejected;
        self.nb_discarded += other.nb_discarded;
        self.nb_total += other.nb_total;
    }
}

/// Classifies `deviations` and keeps at most `nb_candidates_max` frames,
/// preferring the largest deviations (earlier frame wins on ties).
///
/// The first `skip_first` frames count as discards.
pub fn select_candidates(
    deviations: &[f64],
    thresholds: &Thresholds,
    skip_first: usize,
) -> PipelineResult<CandidateSet> {
    thresholds.validate()?;

    let mut set = CandidateSet {
        nb_total: deviations.len(),
        ..Default::default()
    };
    let mut eligible: Vec<(usize, f64)> = Vec::new();

    for (idx, &d) in deviations.iter().enumerate() {
        if idx < skip_first {
            set.nb_discarded += 1;
            continue;
        }
        if d.is_nan() {
            return Err(PipelineError::InvalidArgument(format!(
                "deviation of frame {} is NaN",
                idx
            )));
        }
        match thresholds.classify(d) {
            Band::Discard => set.nb_discarded += 1,
            Band::Candidate => {
                set.nb_candidates += 1;
                eligible.push((idx, d));
            }
            Band::IllDescribed => {
                set.nb_ill_described += 1;
                eligible.push((idx, d));
            }
            Band::Rejected => set.nb_rejected += 1,
        }
    }

    if eligible.len() > thresholds.nb_candidates_max {
        eligible.sort_by(|a, b| match b.1.partial_cmp(&a.1) {
            Some(Ordering::Equal) | None => a.0.cmp(&b.0),
            Some(ord) => ord,
        });
        eligible.truncate(thresholds.nb_candidates_max);
        eligible.sort_by_key(|&(idx, _)| idx);
    }

    set.selected = eligible.into_iter().map(|(idx, _)| idx).collect();
    Ok(set)
}

/// Applies one `cap` to the selections of every trajectory of a subsystem.
///
/// `deviations[k]` are the per-frame deviations behind `sets[k]`. The pooled
/// frames with the largest deviations survive; ties go to the earlier
/// trajectory, then the earlier frame. Counts are left untouched.
pub fn cap_pooled(sets: &mut [CandidateSet], deviations: &[Vec<f64>], cap: usize) -> PipelineResult<()> {
    if sets.len() != deviations.len() {
        return Err(PipelineError::InvalidArgument(format!(
            "{} selections but {} deviation series",
            sets.len(),
            deviations.len()
        )));
    }

    let mut pooled: Vec<(usize, usize, f64)> = Vec::new();
    for (k, set) in sets.iter().enumerate() {
        for &idx in &set.selected {
            let d = deviations[k].get(idx).copied().ok_or_else(|| {
                PipelineError::InvalidArgument(format!(
                    "selection {} refers to frame {} of {}",
                    k,
                    idx,
                    deviations[k].len()
                ))
            })?;
            pooled.push((k, idx, d));
        }
    }
    if pooled.len() <= cap {
        return Ok(());
    }

    pooled.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
            .then(a.1.cmp(&b.1))
    });
    pooled.truncate(cap);

    for set in sets.iter_mut() {
        set.selected.clear();
    }
    for (k, idx, _) in pooled {
        sets[k].selected.push(idx);
    }
    for set in sets.iter_mut() {
        set.selected.sort_unstable();
    }
    Ok(())
}

// ============================================================================
// 3. STEP SCALING
// ============================================================================

/// Multiplier for the next exploration length: 4 when fewer than 10% of
/// frames are problematic, 2 up to 20%, otherwise 1.
pub fn next_iteration_step_factor(nb_candidates: usize, nb_rejected: usize, nb_total: usize) -> u64 {
    if nb_total == 0 {
        return 1;
    }
    let ratio = (nb_candidates + nb_rejected) as f64 / nb_total as f64;
    // The 0.20 edge is inclusive; see DESIGN.md.
    if ratio < 0.10 {
        4
    } else if ratio <= 0.20 {
        2
    } else {
        1
    }
}
