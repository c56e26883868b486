//! Component F: distance-aware Viterbi decoder (spec §4.F, §4.F.seg).
//!
//! Runs the per-sample forward pass over one chromosome-ordered exon list,
//! with CN2-rebase numeric stabilization, then backtracks each
//! per-chromosome segment into maximal constant-state runs and scores them
//! against the all-CN2 baseline.

use crate::cnv::transitions;
use crate::cnv::types::{Cnv, Exon, LikelihoodSlice, Priors, TransMatrix, CN2, NO_CALL, NUM_STATES};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ViterbiError {
    #[error("likelihood row for exon list position {0} contains a non-finite value")]
    NonFinite(usize),
}

/// Natural-log vs. base-10 quality score, per spec §9's open question:
/// larger must mean "more confident" under either choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QualityLogBase {
    Natural,
    Base10,
}

impl Default for QualityLogBase {
    fn default() -> Self {
        QualityLogBase::Natural
    }
}

impl QualityLogBase {
    fn apply(&self, x: f64) -> f64 {
        match self {
            QualityLogBase::Natural => x.ln(),
            QualityLogBase::Base10 => x.log10(),
        }
    }
}

fn argmax4(v: &[f64; NUM_STATES]) -> usize {
    let mut best = 0;
    for i in 1..NUM_STATES {
        if v[i] > v[best] {
            best = i;
        }
    }
    best
}

/// Backtrack one per-chromosome (or post-rebase) segment into CNVs.
///
/// `called_exons[i]` holds the *global* exon index backing `path[i]`,
/// `best_path_probas[i]`, `cn2_path_probas[i]`.
fn build_cnvs(
    called_exons: &[i64],
    path: &[[usize; NUM_STATES]],
    best_path_probas: &[[f64; NUM_STATES]],
    cn2_path_probas: &[f64],
    last_state: usize,
    sample_id: &str,
    quality_log: QualityLogBase,
) -> Vec<Cnv> {
    let mut called_exons = called_exons.to_vec();
    let mut path = path.to_vec();
    let mut best_path_probas = best_path_probas.to_vec();
    let mut cn2_path_probas = cn2_path_probas.to_vec();

    if last_state != CN2 {
        // Only reachable when finalizing at the last exon of a chromosome:
        // append a virtual exon forced into CN2, carrying over the
        // incoming probability at `last_state` so the backtrack below has
        // a CN2 root to start from.
        called_exons.push(-1);
        let mut p = [0usize; NUM_STATES];
        p[CN2] = last_state;
        path.push(p);
        let mut bp = [0.0; NUM_STATES];
        bp[CN2] = best_path_probas.last().unwrap()[last_state];
        best_path_probas.push(bp);
        cn2_path_probas.push(*cn2_path_probas.last().unwrap());
    }

    let n = called_exons.len();
    if n == 0 {
        return Vec::new();
    }

    let mut most_likely_states = vec![0usize; n];
    most_likely_states[n - 1] = CN2;
    let mut current = CN2;
    for cei in (1..n).rev() {
        current = path[cei][current];
        most_likely_states[cei - 1] = current;
    }

    let mut cnvs = Vec::new();
    let mut current_state = most_likely_states[0];
    let mut first_in_run = 0usize;

    for cei in 1..n {
        if most_likely_states[cei] == current_state {
            continue;
        }
        if current_state != CN2 {
            let mut quality =
                best_path_probas[cei][most_likely_states[cei]] / cn2_path_probas[cei];
            if first_in_run > 0 {
                quality /= best_path_probas[first_in_run - 1][most_likely_states[first_in_run - 1]];
                quality *= cn2_path_probas[first_in_run - 1];
            }
            cnvs.push(Cnv {
                cn_state: current_state as u8,
                first_exon_idx: called_exons[first_in_run] as usize,
                last_exon_idx: called_exons[cei - 1] as usize,
                quality_score: quality_log.apply(quality),
                sample_id: sample_id.to_string(),
            });
        }
        current_state = most_likely_states[cei];
        first_in_run = cei;
    }

    cnvs
}

/// Decode one sample's likelihood slice over `exon_list` (global exon
/// indices, in order, contiguous per chromosome) into a list of CNVs,
/// sorted by `(chrom order, first_exon_idx)` as in `exon_list`.
pub fn decode(
    exon_list: &[usize],
    exons: &[Exon],
    likelihoods: &LikelihoodSlice,
    trans_base: &TransMatrix,
    priors: &Priors,
    dmax: i64,
    power: f64,
    quality_log: QualityLogBase,
    sample_id: &str,
) -> Result<Vec<Cnv>, ViterbiError> {
    if exon_list.is_empty() {
        return Ok(Vec::new());
    }

    let mut probs_prev = [0.0, 0.0, 1.0, 0.0];
    let mut prev_chrom = exons[exon_list[0]].chrom.clone();
    let mut prev_end: i64 = -dmax;

    let mut called_exons: Vec<i64> = Vec::new();
    let mut path: Vec<[usize; NUM_STATES]> = Vec::new();
    let mut best_path_probas: Vec<[f64; NUM_STATES]> = Vec::new();
    let mut cn2_path_probas: Vec<f64> = Vec::new();

    let mut cnvs = Vec::new();

    for (i, &global_idx) in exon_list.iter().enumerate() {
        let exon = &exons[global_idx];
        let row = likelihoods.row(i);
        if row[0] == NO_CALL {
            continue;
        }
        if row.iter().any(|v| !v.is_finite()) {
            return Err(ViterbiError::NonFinite(i));
        }

        if exon.chrom != prev_chrom {
            if path.iter().any(|p| p[CN2] != CN2) {
                let last_state = argmax4(best_path_probas.last().unwrap());
                cnvs.extend(build_cnvs(
                    &called_exons,
                    &path,
                    &best_path_probas,
                    &cn2_path_probas,
                    last_state,
                    sample_id,
                    quality_log,
                ));
            }
            probs_prev = [0.0, 0.0, 1.0, 0.0];
            prev_chrom = exon.chrom.clone();
            prev_end = -dmax;
            called_exons.clear();
            path.clear();
            best_path_probas.clear();
            cn2_path_probas.clear();
        }

        let dist = exon.start as i64 - prev_end - 1;
        let adjusted = transitions::adjust(trans_base, priors, dist, dmax, power);

        let mut probs_cur = [0.0_f64; NUM_STATES];
        let mut best_prev = [CN2; NUM_STATES];
        let mut cn2_path_proba = 0.0;

        for c in 0..NUM_STATES {
            let mut prob_max = -1.0_f64;
            let mut prev_state_max = CN2;
            for p in 0..NUM_STATES {
                let prob = probs_prev[p] * adjusted[[p, c]] * row[c];
                if prob > prob_max {
                    prob_max = prob;
                    prev_state_max = p;
                }
                if c == CN2 && p == CN2 {
                    cn2_path_proba = prob;
                }
            }
            probs_cur[c] = prob_max.max(0.0);
            if prob_max > 0.0 {
                best_prev[c] = prev_state_max;
            }
        }

        if best_prev.iter().all(|&p| p == CN2) {
            if path.iter().any(|p| p[CN2] != CN2) {
                cnvs.extend(build_cnvs(
                    &called_exons,
                    &path,
                    &best_path_probas,
                    &cn2_path_probas,
                    CN2,
                    sample_id,
                    quality_log,
                ));
            }
            if !called_exons.is_empty() {
                let denom = probs_prev[CN2];
                for v in probs_cur.iter_mut() {
                    *v = if denom != 0.0 { *v / denom } else { 0.0 };
                }
                let last_cn2 = *cn2_path_probas.last().unwrap();
                cn2_path_proba = if last_cn2 != 0.0 {
                    cn2_path_proba / last_cn2
                } else {
                    0.0
                };
                called_exons.clear();
                path.clear();
                best_path_probas.clear();
                cn2_path_probas.clear();
            }
        }

        probs_prev = probs_cur;
        prev_end = exon.end as i64;
        called_exons.push(global_idx as i64);
        path.push(best_prev);
        best_path_probas.push(probs_cur);
        cn2_path_probas.push(cn2_path_proba);
    }

    if path.iter().any(|p| p[CN2] != CN2) {
        let last_state = argmax4(best_path_probas.last().unwrap());
        cnvs.extend(build_cnvs(
            &called_exons,
            &path,
            &best_path_probas,
            &cn2_path_probas,
            last_state,
            sample_id,
            quality_log,
        ));
    }

    Ok(cnvs)
}
