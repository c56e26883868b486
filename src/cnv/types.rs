//! Data model shared by every stage of the CNV calling core.
//!
//! Exon indices are stable across all arrays in a given invocation: every
//! `usize` that this module calls an "exon index" indexes into the same
//! `exons: Vec<Exon>` list for the lifetime of a run.

use serde::{Deserialize, Serialize};

/// One target interval, 0-based half-open, matching the BED convention the
/// upstream (out-of-scope) ingestion/normalization stage uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct Exon {
    #[new(into)]
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    #[new(into)]
    pub exon_id: String,
}

impl Exon {
    /// Length in base pairs; exons are strictly positive-length per spec §6.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a cluster (and the exon subset it is fit over) is autosomal or
/// gonosomal. The two exon subsets a run operates over are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterType {
    Autosomal,
    Gonosomal,
}

/// A cluster of samples with a similar coverage profile, fit jointly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub cluster_type: ClusterType,
    /// Sample indices (into the global sample list) that this cluster calls
    /// CNVs for.
    pub samples: Vec<usize>,
    /// Other clusters whose samples augment this cluster's fit without
    /// joining its call set.
    pub controls: Vec<String>,
}

/// Outcome tag for the exon filter cascade (spec §4.C) applied to one exon
/// within one cluster's fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum ExonFilterTag {
    /// Filter n°1: `median(FPM) == 0` across the cluster.
    Med0,
    /// Filter n°2: the robust Gaussian fit did not converge on a window.
    NoRg,
    /// Filter n°3a: the robust Gaussian mean is exactly zero.
    Mean0,
    /// Filter n°3b: the robust Gaussian mean is not well separated from the
    /// low-coverage population (pseudo z-score < 3).
    LowZ,
    /// Filter n°4: fewer than half the samples fall within the robust
    /// Gaussian's ±2σ window.
    LowWeight,
    /// The exon passed every filter and carries a `(mean, stdev)` pair.
    Callable,
}

/// Per-(cluster, exon) fit outcome: either a filter rejection tag, or the
/// `(mean, stdev)` pair of the exon's robust Gaussian, tagged `Callable`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExonMetrics {
    pub tag: ExonFilterTag,
    pub mean: f64,
    pub stdev: f64,
}

impl ExonMetrics {
    pub fn rejected(tag: ExonFilterTag) -> Self {
        debug_assert_ne!(tag, ExonFilterTag::Callable);
        Self {
            tag,
            mean: 0.0,
            stdev: 0.0,
        }
    }

    pub fn callable(mean: f64, stdev: f64) -> Self {
        Self {
            tag: ExonFilterTag::Callable,
            mean,
            stdev,
        }
    }

    pub fn is_callable(&self) -> bool {
        self.tag == ExonFilterTag::Callable
    }
}

/// Per-cluster tally of how many exons landed in each filter bucket,
/// surfaced to the caller for diagnostics per spec §7.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCounters {
    pub med0: usize,
    pub no_rg: usize,
    pub mean0: usize,
    pub low_z: usize,
    pub low_weight: usize,
    pub callable: usize,
}

impl FilterCounters {
    pub fn record(&mut self, tag: ExonFilterTag) {
        match tag {
            ExonFilterTag::Med0 => self.med0 += 1,
            ExonFilterTag::NoRg => self.no_rg += 1,
            ExonFilterTag::Mean0 => self.mean0 += 1,
            ExonFilterTag::LowZ => self.low_z += 1,
            ExonFilterTag::LowWeight => self.low_weight += 1,
            ExonFilterTag::Callable => self.callable += 1,
        }
    }

    pub fn merge(&mut self, other: &FilterCounters) {
        self.med0 += other.med0;
        self.no_rg += other.no_rg;
        self.mean0 += other.mean0;
        self.low_z += other.low_z;
        self.low_weight += other.low_weight;
        self.callable += other.callable;
    }
}

/// Number of copy-number states the HMM operates over: CN0, CN1, CN2, CN3+.
pub const NUM_STATES: usize = 4;

/// Sentinel value marking a no-call entry in the likelihood tensor.
pub const NO_CALL: f64 = -1.0;

/// CN2, the wild-type state every per-chromosome path is rooted at.
pub const CN2: usize = 2;

/// Dense per-sample likelihood slice: `likelihoods[exon][state]`.
///
/// Either all four entries for an exon are `NO_CALL`, or all four are
/// finite and non-negative and sum to 1 (within `1e-6`), the tensor
/// invariant from spec §8.1.
pub type LikelihoodSlice = ndarray::Array2<f64>;

/// One called copy-number variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cnv {
    /// 0, 1, or 3; CN2 runs are never emitted.
    pub cn_state: u8,
    pub first_exon_idx: usize,
    pub last_exon_idx: usize,
    pub quality_score: f64,
    pub sample_id: String,
}

/// Row-stochastic 4x4 base transition matrix `T`.
pub type TransMatrix = ndarray::Array2<f64>;

/// Prior probabilities over the four CN states, summing to 1.
pub type Priors = [f64; NUM_STATES];
