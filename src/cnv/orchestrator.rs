//! Component G: orchestrator (spec §4, §5, §7).
//!
//! Wires components A-F together: fits each cluster (A-C), evaluates
//! emissions (D) to populate the likelihood tensor, then decodes (E+F) each
//! sample's autosomal and gonosomal exon lists independently, aggregating
//! per-cluster filter counters and per-sample CNVs for the caller.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::cnv::density::{self, BandwidthRule};
use crate::cnv::emission::{self, Cn3Model};
use crate::cnv::filter;
use crate::cnv::types::{
    Cluster, ClusterType, Cnv, Exon, FilterCounters, LikelihoodSlice, Priors, TransMatrix, NO_CALL,
    NUM_STATES,
};
use crate::cnv::viterbi::{self, QualityLogBase, ViterbiError};

/// Every Open-Question knob from spec §9, bundled so a run is reproducible
/// from one value (mirrors how `priors`/`transMatrixBase` travel as a unit
/// in spec §6).
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CallParams {
    pub bandwidth_rule: BandwidthRule,
    pub cn3_model: Cn3Model,
    pub transition_power: f64,
    pub quality_log_base: QualityLogBase,
    pub dmax: i64,
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            bandwidth_rule: BandwidthRule::Scott,
            cn3_model: Cn3Model::Gaussian,
            transition_power: crate::cnv::transitions::DEFAULT_POWER,
            quality_log_base: QualityLogBase::Natural,
            dmax: 10_000_000,
        }
    }
}

/// A per-sample Viterbi failure (spec §7 `SampleDecodeFailure`): reported,
/// does not abort the batch.
#[derive(Debug, Clone)]
pub struct SampleDecodeFailure {
    pub sample_id: String,
    pub cause: ViterbiError,
}

/// The full emission tensor `L[exon, sample*4 + state]`, flattened to a
/// dense `E x (S*4)` matrix (spec §3's `L[E, S, 4]`, without a 3-D
/// dependency). Distinct from [`LikelihoodSlice`], which is one sample's
/// `exon x state` view into it.
pub type EmissionTensor = ndarray::Array2<f64>;

/// Everything one invocation of the core produces: the populated likelihood
/// tensor, the aggregated per-cluster filter counters, the CNV list, and any
/// per-sample failures.
pub struct CallOutcome {
    pub likelihoods: EmissionTensor,
    pub filter_counters: FilterCounters,
    pub cnvs: Vec<Cnv>,
    pub failures: Vec<SampleDecodeFailure>,
}

/// Fit one cluster (A-C) and populate its slice of the likelihood tensor.
///
/// `counts_norm` is the full `E x S` matrix; `exon_indices` restricts the
/// fit to this cluster's exon subset (autosomal or gonosomal, per spec
/// §3). Returns the per-cluster filter counters; a cluster-level fit
/// failure (A) is logged and leaves every (exon, sample) slot at the
/// sentinel, per spec §7 ("cluster-level failures are local and silent
/// except for counters").
fn fit_cluster_into_tensor(
    cluster: &Cluster,
    clusters_by_id: &HashMap<&str, &Cluster>,
    exon_indices: &[usize],
    counts_norm: &ndarray::Array2<f64>,
    sample_ids: &[String],
    priors: &Priors,
    cn3_model: Cn3Model,
    bandwidth_rule: BandwidthRule,
    likelihoods: &mut EmissionTensor,
) -> FilterCounters {
    let mut counters = FilterCounters::default();

    // Controls widen the population the fit is estimated over but never
    // receive likelihoods of their own (spec §3: "augment the fit, not the
    // call set"): pull in each named control cluster's samples, deduped,
    // without adding them to the loop below that writes emissions.
    let mut fit_samples: Vec<usize> = cluster.samples.clone();
    for control_id in &cluster.controls {
        match clusters_by_id.get(control_id.as_str()) {
            Some(control) => fit_samples.extend(control.samples.iter().copied()),
            None => tracing::warn!(
                cluster = %cluster.id,
                control = %control_id,
                "control cluster id not found; ignoring"
            ),
        }
    }
    fit_samples.sort_unstable();
    fit_samples.dedup();

    let mean_per_exon: Vec<f64> = exon_indices
        .iter()
        .map(|&e| {
            let row = counts_norm.row(e);
            let sum: f64 = fit_samples.iter().map(|&s| row[s]).sum();
            sum / fit_samples.len() as f64
        })
        .collect();

    let cluster_fit = match density::fit_cluster(&mean_per_exon, bandwidth_rule) {
        Ok(fit) => fit,
        Err(err) => {
            tracing::warn!(
                cluster = %cluster.id,
                error = %err,
                "cluster fit failed (NO_LOCAL_MIN / GAMMA_FIT_FAIL / NO_UNCOV_THRESHOLD); \
                 leaving its exons at the no-call sentinel"
            );
            return counters;
        }
    };

    for &e in exon_indices {
        let fpms: Vec<f64> = fit_samples.iter().map(|&s| counts_norm[[e, s]]).collect();
        let metrics = filter::filter_exon(&fpms, cluster_fit.uncov_threshold);
        counters.record(metrics.tag);
        tracing::debug!(cluster = %cluster.id, exon = e, tag = %metrics.tag, "exon filter outcome");

        if !metrics.is_callable() {
            continue;
        }

        for &s in &cluster.samples {
            let fpm = counts_norm[[e, s]];
            let q = emission::evaluate(
                &cluster_fit.gamma,
                cluster_fit.uncov_threshold,
                metrics.mean,
                metrics.stdev,
                priors,
                cn3_model,
                fpm,
            );
            let mut row = likelihoods.row_mut(e);
            match q {
                Some(q) => {
                    for c in 0..NUM_STATES {
                        row[s * NUM_STATES + c] = q[c];
                    }
                }
                None => {
                    tracing::debug!(
                        cluster = %cluster.id,
                        exon = e,
                        sample = %sample_ids[s],
                        "emission evaluator produced zero mass; no-call"
                    );
                }
            }
        }
    }

    counters
}

/// Fit every cluster and build the `E x (S*4)` emission tensor, plus the
/// aggregated per-cluster filter counters (spec §7's "orchestrator reports
/// per-cluster filter counters").
///
/// Clusters are fit in parallel (spec §5: "independent across clusters...
/// each writes to a disjoint set of (exon, sample) slots"); the disjointness
/// comes from each cluster writing only its own samples' columns.
pub fn fit_clusters(
    clusters: &[Cluster],
    autosomal_exons: &[usize],
    gonosomal_exons: &[usize],
    counts_norm: &ndarray::Array2<f64>,
    sample_ids: &[String],
    priors: &Priors,
    params: &CallParams,
) -> (EmissionTensor, FilterCounters) {
    let num_exons = counts_norm.nrows();
    let num_samples = counts_norm.ncols();
    let mut likelihoods = EmissionTensor::from_elem((num_exons, num_samples * NUM_STATES), NO_CALL);

    let clusters_by_id: HashMap<&str, &Cluster> =
        clusters.iter().map(|c| (c.id.as_str(), c)).collect();

    let per_cluster: Vec<(FilterCounters, EmissionTensor)> = clusters
        .par_iter()
        .map(|cluster| {
            let exon_indices: &[usize] = match cluster.cluster_type {
                ClusterType::Autosomal => autosomal_exons,
                ClusterType::Gonosomal => gonosomal_exons,
            };
            let mut local = EmissionTensor::from_elem((num_exons, num_samples * NUM_STATES), NO_CALL);
            let counters = fit_cluster_into_tensor(
                cluster,
                &clusters_by_id,
                exon_indices,
                counts_norm,
                sample_ids,
                priors,
                params.cn3_model,
                params.bandwidth_rule,
                &mut local,
            );
            (counters, local)
        })
        .collect();

    let mut total_counters = FilterCounters::default();
    for (counters, local) in per_cluster {
        total_counters.merge(&counters);
        for ((e, sc), v) in local.indexed_iter() {
            if *v != NO_CALL {
                likelihoods[[e, sc]] = *v;
            }
        }
    }

    (likelihoods, total_counters)
}

fn sample_slice(likelihoods: &EmissionTensor, sample_idx: usize, exon_indices: &[usize]) -> LikelihoodSlice {
    let mut slice = LikelihoodSlice::zeros((exon_indices.len(), NUM_STATES));
    for (row, &e) in exon_indices.iter().enumerate() {
        for c in 0..NUM_STATES {
            slice[[row, c]] = likelihoods[[e, sample_idx * NUM_STATES + c]];
        }
    }
    slice
}

/// Decode every sample's autosomal and gonosomal exon lists (F), in
/// parallel across samples (spec §5: "embarrassingly parallel across
/// samples; each sample writes to its own CNV list").
///
/// A per-sample Viterbi failure is collected rather than propagated (spec
/// §7: "other samples continue").
pub fn decode_samples(
    sample_ids: &[String],
    exons: &[Exon],
    autosomal_exons: &[usize],
    gonosomal_exons: &[usize],
    likelihoods: &EmissionTensor,
    trans_base: &TransMatrix,
    priors: &Priors,
    params: &CallParams,
) -> (Vec<Cnv>, Vec<SampleDecodeFailure>) {
    let results: Vec<(Vec<Cnv>, Vec<SampleDecodeFailure>)> = sample_ids
        .par_iter()
        .enumerate()
        .map(|(s, sample_id)| {
            let mut cnvs = Vec::new();
            let mut failures = Vec::new();
            for exon_list in [autosomal_exons, gonosomal_exons] {
                if exon_list.is_empty() {
                    continue;
                }
                let slice = sample_slice(likelihoods, s, exon_list);
                match viterbi::decode(
                    exon_list,
                    exons,
                    &slice,
                    trans_base,
                    priors,
                    params.dmax,
                    params.transition_power,
                    params.quality_log_base,
                    sample_id,
                ) {
                    Ok(mut decoded) => cnvs.append(&mut decoded),
                    Err(cause) => {
                        tracing::error!(sample = %sample_id, %cause, "Viterbi decoding failed for sample");
                        failures.push(SampleDecodeFailure {
                            sample_id: sample_id.clone(),
                            cause,
                        });
                    }
                }
            }
            (cnvs, failures)
        })
        .collect();

    let mut cnvs = Vec::new();
    let mut failures = Vec::new();
    for (mut c, mut f) in results {
        cnvs.append(&mut c);
        failures.append(&mut f);
    }
    (cnvs, failures)
}

fn log_cnv_counts(cnvs: &[Cnv]) {
    let (mut cn0, mut cn1, mut cn3) = (0usize, 0usize, 0usize);
    for cnv in cnvs {
        match cnv.cn_state {
            0 => cn0 += 1,
            1 => cn1 += 1,
            3 => cn3 += 1,
            other => tracing::warn!(cn_state = other, "unexpected CN state in output"),
        }
    }
    tracing::info!(cn0, cn1, cn3, total = cnvs.len(), "CNV counts by state");
}

/// Run the whole core end to end: fit every cluster, populate the
/// likelihood tensor, decode every sample, and aggregate.
///
/// Fails fast with [`crate::err::AppError::ShapeMismatch`] if `trans_base`
/// is not a `NUM_STATES x NUM_STATES` matrix, the one fatal,
/// programmer-error-class failure in the error model (spec §7); every
/// other failure mode (cluster fit, per-sample decode) is captured as a
/// value in [`CallOutcome`] instead.
pub fn run(
    clusters: &[Cluster],
    exons: &[Exon],
    autosomal_exons: &[usize],
    gonosomal_exons: &[usize],
    counts_norm: &ndarray::Array2<f64>,
    sample_ids: &[String],
    priors: &Priors,
    trans_base: &TransMatrix,
    params: &CallParams,
) -> Result<CallOutcome, crate::err::AppError> {
    if trans_base.nrows() != NUM_STATES || trans_base.ncols() != NUM_STATES {
        return Err(crate::err::AppError::ShapeMismatch {
            trans_states: trans_base.nrows().max(trans_base.ncols()),
            tensor_states: NUM_STATES,
        });
    }

    let (likelihoods, filter_counters) = fit_clusters(
        clusters,
        autosomal_exons,
        gonosomal_exons,
        counts_norm,
        sample_ids,
        priors,
        params,
    );
    tracing::info!(?filter_counters, "per-cluster filter counters");

    let (cnvs, failures) = decode_samples(
        sample_ids,
        exons,
        autosomal_exons,
        gonosomal_exons,
        &likelihoods,
        trans_base,
        priors,
        params,
    );
    log_cnv_counts(&cnvs);

    Ok(CallOutcome {
        likelihoods,
        filter_counters,
        cnvs,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn exon(chrom: &str, i: usize) -> Exon {
        Exon::new(chrom, i as u64 * 200, i as u64 * 200 + 100, &format!("EX{i}"))
    }

    fn strongly_diagonal_trans() -> TransMatrix {
        ndarray::arr2(&[
            [0.999, 0.0003, 0.0004, 0.0003],
            [0.001, 0.997, 0.001, 0.001],
            [0.0005, 0.001, 0.997, 0.0015],
            [0.001, 0.001, 0.001, 0.997],
        ])
    }

    fn single_cluster(num_samples: usize) -> Vec<Cluster> {
        vec![Cluster {
            id: "cluster0".to_string(),
            cluster_type: ClusterType::Autosomal,
            samples: (0..num_samples).collect(),
            controls: Vec::new(),
        }]
    }

    fn draw_normal(mean: f64, stdev: f64, n: usize, seed: u64) -> Vec<f64> {
        let dist = Normal::new(mean, stdev).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n).map(|_| dist.sample(&mut rng).max(0.0)).collect()
    }

    /// S1: one cluster of 20 samples, 500 exons, all N(10,1); expect zero
    /// CNVs and near-certain CN2 likelihood everywhere callable.
    #[test]
    fn s1_uniform_coverage_emits_no_cnvs() {
        let num_samples = 20;
        let num_exons = 500;
        let exons: Vec<Exon> = (0..num_exons).map(|i| exon("chr1", i)).collect();
        let autosomal: Vec<usize> = (0..num_exons).collect();
        let sample_ids: Vec<String> = (0..num_samples).map(|s| format!("S{s}")).collect();

        let mut counts = ndarray::Array2::<f64>::zeros((num_exons, num_samples));
        for s in 0..num_samples {
            let col = draw_normal(10.0, 1.0, num_exons, 100 + s as u64);
            for (e, v) in col.into_iter().enumerate() {
                counts[[e, s]] = v;
            }
        }

        let priors = [0.001, 0.01, 0.978, 0.011];
        let params = CallParams::default();
        let outcome = run(
            &single_cluster(num_samples),
            &exons,
            &autosomal,
            &[],
            &counts,
            &sample_ids,
            &priors,
            &strongly_diagonal_trans(),
            &params,
        )
        .unwrap();

        assert!(outcome.cnvs.is_empty());
        assert!(outcome.failures.is_empty());
        assert!(outcome.filter_counters.callable > 0);
    }

    /// S2: sample 0 has exons 100-120 drawn from N(5,1) (planted CN1).
    #[test]
    fn s2_planted_cn1_segment_is_called_for_one_sample() {
        let num_samples = 20;
        let num_exons = 500;
        let exons: Vec<Exon> = (0..num_exons).map(|i| exon("chr1", i)).collect();
        let autosomal: Vec<usize> = (0..num_exons).collect();
        let sample_ids: Vec<String> = (0..num_samples).map(|s| format!("S{s}")).collect();

        let mut counts = ndarray::Array2::<f64>::zeros((num_exons, num_samples));
        for s in 0..num_samples {
            let col = draw_normal(10.0, 1.0, num_exons, 200 + s as u64);
            for (e, v) in col.into_iter().enumerate() {
                counts[[e, s]] = v;
            }
        }
        let planted = draw_normal(5.0, 1.0, 21, 999);
        for (offset, v) in planted.into_iter().enumerate() {
            counts[[100 + offset, 0]] = v;
        }

        let priors = [0.001, 0.01, 0.978, 0.011];
        let params = CallParams::default();
        let outcome = run(
            &single_cluster(num_samples),
            &exons,
            &autosomal,
            &[],
            &counts,
            &sample_ids,
            &priors,
            &strongly_diagonal_trans(),
            &params,
        )
        .unwrap();

        let sample0_cnvs: Vec<&Cnv> = outcome.cnvs.iter().filter(|c| c.sample_id == "S0").collect();
        assert_eq!(sample0_cnvs.len(), 1);
        assert_eq!(sample0_cnvs[0].cn_state, 1);
        assert!(sample0_cnvs[0].first_exon_idx.abs_diff(100) <= 1);
        assert!(sample0_cnvs[0].last_exon_idx.abs_diff(120) <= 1);
        assert!(sample0_cnvs[0].quality_score > 0.0);

        for s in 1..num_samples {
            let cnvs_s: Vec<&Cnv> = outcome.cnvs.iter().filter(|c| c.sample_id == format!("S{s}")).collect();
            assert!(cnvs_s.is_empty());
        }
    }

    /// S4: sample has exons 200-205 drawn from N(15,1) (planted CN3+).
    #[test]
    fn s4_planted_cn3_segment_is_called() {
        let num_samples = 20;
        let num_exons = 500;
        let exons: Vec<Exon> = (0..num_exons).map(|i| exon("chr1", i)).collect();
        let autosomal: Vec<usize> = (0..num_exons).collect();
        let sample_ids: Vec<String> = (0..num_samples).map(|s| format!("S{s}")).collect();

        let mut counts = ndarray::Array2::<f64>::zeros((num_exons, num_samples));
        for s in 0..num_samples {
            let col = draw_normal(10.0, 1.0, num_exons, 300 + s as u64);
            for (e, v) in col.into_iter().enumerate() {
                counts[[e, s]] = v;
            }
        }
        let planted = draw_normal(15.0, 1.0, 6, 1234);
        for (offset, v) in planted.into_iter().enumerate() {
            counts[[200 + offset, 0]] = v;
        }

        let priors = [0.001, 0.01, 0.978, 0.011];
        let params = CallParams::default();
        let outcome = run(
            &single_cluster(num_samples),
            &exons,
            &autosomal,
            &[],
            &counts,
            &sample_ids,
            &priors,
            &strongly_diagonal_trans(),
            &params,
        )
        .unwrap();

        let sample0_cnvs: Vec<&Cnv> = outcome.cnvs.iter().filter(|c| c.sample_id == "S0").collect();
        assert_eq!(sample0_cnvs.len(), 1);
        assert_eq!(sample0_cnvs[0].cn_state, 3);
    }

    #[test]
    fn autosomal_and_gonosomal_exon_sets_stay_disjoint_per_cluster_type() {
        let num_samples = 4;
        let num_exons = 40;
        let exons: Vec<Exon> = (0..num_exons).map(|i| exon("chr1", i)).collect();
        let autosomal: Vec<usize> = (0..20).collect();
        let gonosomal: Vec<usize> = (20..40).collect();
        let sample_ids: Vec<String> = (0..num_samples).map(|s| format!("S{s}")).collect();

        let mut counts = ndarray::Array2::<f64>::zeros((num_exons, num_samples));
        for s in 0..num_samples {
            let col = draw_normal(10.0, 1.0, num_exons, 400 + s as u64);
            for (e, v) in col.into_iter().enumerate() {
                counts[[e, s]] = v;
            }
        }

        let clusters = vec![
            Cluster {
                id: "autoCluster".to_string(),
                cluster_type: ClusterType::Autosomal,
                samples: (0..num_samples).collect(),
                controls: Vec::new(),
            },
            Cluster {
                id: "gonoCluster".to_string(),
                cluster_type: ClusterType::Gonosomal,
                samples: (0..num_samples).collect(),
                controls: Vec::new(),
            },
        ];

        let priors = [0.001, 0.01, 0.978, 0.011];
        let params = CallParams::default();
        let (likelihoods, counters) = fit_clusters(
            &clusters,
            &autosomal,
            &gonosomal,
            &counts,
            &sample_ids,
            &priors,
            &params,
        );

        assert_eq!(likelihoods.nrows(), num_exons);
        assert!(counters.callable > 0);
    }

    #[test]
    fn control_cluster_samples_augment_fit_but_receive_no_likelihoods() {
        let num_exons = 60;
        let exons: Vec<Exon> = (0..num_exons).map(|i| exon("chr1", i)).collect();
        let autosomal: Vec<usize> = (0..num_exons).collect();
        // Samples 0-1 are the call cluster; samples 2-19 are control-only.
        let num_samples = 20;
        let sample_ids: Vec<String> = (0..num_samples).map(|s| format!("S{s}")).collect();

        let mut counts = ndarray::Array2::<f64>::zeros((num_exons, num_samples));
        for s in 0..num_samples {
            let col = draw_normal(10.0, 1.0, num_exons, 500 + s as u64);
            for (e, v) in col.into_iter().enumerate() {
                counts[[e, s]] = v;
            }
        }

        let clusters = vec![
            Cluster {
                id: "calls".to_string(),
                cluster_type: ClusterType::Autosomal,
                samples: vec![0, 1],
                controls: vec!["pool".to_string()],
            },
            Cluster {
                id: "pool".to_string(),
                cluster_type: ClusterType::Autosomal,
                samples: (2..num_samples).collect(),
                controls: Vec::new(),
            },
        ];

        let priors = [0.001, 0.01, 0.978, 0.011];
        let params = CallParams::default();
        let (likelihoods, counters) = fit_clusters(
            &clusters,
            &autosomal,
            &[],
            &counts,
            &sample_ids,
            &priors,
            &params,
        );

        assert!(counters.callable > 0);
        // A control-only sample (index 2, belonging only to "pool") never
        // appears in any cluster's call set, so its column stays NO_CALL.
        for e in 0..num_exons {
            for c in 0..NUM_STATES {
                assert_eq!(likelihoods[[e, 2 * NUM_STATES + c]], NO_CALL);
            }
        }
    }

    #[test]
    fn mismatched_transition_matrix_shape_is_fatal() {
        let exons: Vec<Exon> = (0..5).map(|i| exon("chr1", i)).collect();
        let autosomal: Vec<usize> = (0..5).collect();
        let sample_ids: Vec<String> = vec!["S0".to_string()];
        let counts = ndarray::Array2::<f64>::from_elem((5, 1), 10.0);
        let priors = [0.001, 0.01, 0.978, 0.011];
        let bad_trans = ndarray::Array2::<f64>::eye(3);

        let result = run(
            &single_cluster(1),
            &exons,
            &autosomal,
            &[],
            &counts,
            &sample_ids,
            &priors,
            &bad_trans,
            &CallParams::default(),
        );

        assert!(matches!(
            result,
            Err(crate::err::AppError::ShapeMismatch { .. })
        ));
    }
}
