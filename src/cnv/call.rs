//! `cnv call` subcommand: reads the external interfaces spec §6 defines
//! (exons + normalized counts, cluster membership, priors, transition
//! matrix), runs the orchestrator (component G), and writes the emission
//! tensor and CNV list back out.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use crate::cnv::density::BandwidthRule;
use crate::cnv::emission::Cn3Model;
use crate::cnv::orchestrator::{self, CallParams};
use crate::cnv::types::{Cluster, ClusterType, Exon, Priors, TransMatrix, NUM_STATES};
use crate::cnv::viterbi::QualityLogBase;

#[derive(thiserror::Error, Debug)]
pub enum CallInputError {
    #[error("counts file has no header row")]
    MissingHeader,
    #[error("counts file header must start with chrom,start,end,exonID")]
    BadHeader,
    #[error("priors must be 4 comma-separated floats summing to 1, got {0:?}")]
    BadPriors(String),
    #[error("transition matrix must be 4 semicolon-separated rows of 4 comma-separated floats, got {0:?}")]
    BadTransMatrix(String),
    #[error("cluster {0:?} references unknown sample {1:?}")]
    UnknownSample(String, String),
    #[error("cluster type must be \"A\" (autosomal) or \"G\" (gonosomal), got {0:?}")]
    BadClusterType(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
}

/// Command line arguments for `cnv call`.
#[derive(Debug, clap::Parser)]
#[command(author, version, about = "call germline exon-level CNVs", long_about = None)]
pub struct Args {
    /// Path to the normalized count matrix: a TSV with header
    /// `chrom\tstart\tend\texonID\t<sample1>\t<sample2>\t...`.
    #[clap(long)]
    pub counts: String,
    /// Path to the cluster membership TSV: columns `cluster_id`,
    /// `cluster_type` (`A`|`G`), `sample_id`, `controls` (comma-separated
    /// cluster IDs, empty if none).
    #[clap(long)]
    pub clusters: String,
    /// Path to write the emission tensor to (sparse CSV: one row per
    /// non-sentinel `(exon, sample)` entry).
    #[clap(long)]
    pub out_likelihoods: String,
    /// Path to write the called CNVs to (CSV).
    #[clap(long)]
    pub out_cnvs: String,
    /// Prior probabilities for CN0,CN1,CN2,CN3+, comma-separated, summing to 1.
    #[clap(long, default_value = "0.001,0.01,0.978,0.011")]
    pub priors: String,
    /// Base transition matrix, 4 semicolon-separated rows of 4
    /// comma-separated floats, row-stochastic.
    #[clap(
        long,
        default_value = "0.999,0.0003,0.0004,0.0003;0.001,0.997,0.001,0.001;0.0005,0.001,0.997,0.0015;0.001,0.001,0.001,0.997"
    )]
    pub trans_matrix: String,
    /// Maximum inter-exon genomic distance (bp) beyond which transitions
    /// collapse to the priors.
    #[clap(long, default_value_t = 10_000_000)]
    pub dmax: i64,
    /// KDE bandwidth selection rule for the density/threshold estimator.
    #[clap(long, value_enum, default_value_t = BandwidthRuleArg::Scott)]
    pub kde_bandwidth_mode: BandwidthRuleArg,
    /// CN3+ emission model.
    #[clap(long, value_enum, default_value_t = Cn3ModelArg::Gaussian)]
    pub cn3_model: Cn3ModelArg,
    /// Power-law exponent of the distance-based transition interpolation.
    #[clap(long, default_value_t = crate::cnv::transitions::DEFAULT_POWER)]
    pub transition_power: f64,
    /// Logarithm base used for CNV quality scores.
    #[clap(long, value_enum, default_value_t = QualityLogBaseArg::Natural)]
    pub quality_log_base: QualityLogBaseArg,
    /// Number of worker threads; defaults to available parallelism.
    #[clap(long)]
    pub jobs: Option<usize>,
    /// Optional path to a JSON-serialized `CallParams`; when given, it
    /// overrides `--kde-bandwidth-mode`, `--cn3-model`,
    /// `--transition-power`, `--quality-log-base` and `--dmax` as a single
    /// reproducible unit (see spec §6's `priors`/`transMatrixBase` shape).
    #[clap(long)]
    pub params: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BandwidthRuleArg {
    Scott,
    Silverman,
}

impl From<BandwidthRuleArg> for BandwidthRule {
    fn from(v: BandwidthRuleArg) -> Self {
        match v {
            BandwidthRuleArg::Scott => BandwidthRule::Scott,
            BandwidthRuleArg::Silverman => BandwidthRule::Silverman,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Cn3ModelArg {
    Gaussian,
    GammaTail,
}

impl From<Cn3ModelArg> for Cn3Model {
    fn from(v: Cn3ModelArg) -> Self {
        match v {
            Cn3ModelArg::Gaussian => Cn3Model::Gaussian,
            Cn3ModelArg::GammaTail => Cn3Model::GammaTail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum QualityLogBaseArg {
    Natural,
    Base10,
}

impl From<QualityLogBaseArg> for QualityLogBase {
    fn from(v: QualityLogBaseArg) -> Self {
        match v {
            QualityLogBaseArg::Natural => QualityLogBase::Natural,
            QualityLogBaseArg::Base10 => QualityLogBase::Base10,
        }
    }
}

fn parse_priors(s: &str) -> Result<Priors, CallInputError> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()?;
    if parts.len() != NUM_STATES {
        return Err(CallInputError::BadPriors(s.to_string()));
    }
    let sum: f64 = parts.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return Err(CallInputError::BadPriors(s.to_string()));
    }
    Ok([parts[0], parts[1], parts[2], parts[3]])
}

fn parse_trans_matrix(s: &str) -> Result<TransMatrix, CallInputError> {
    let rows: Vec<&str> = s.split(';').collect();
    if rows.len() != NUM_STATES {
        return Err(CallInputError::BadTransMatrix(s.to_string()));
    }
    let mut m = TransMatrix::zeros((NUM_STATES, NUM_STATES));
    for (i, row) in rows.iter().enumerate() {
        let values: Vec<f64> = row
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()?;
        if values.len() != NUM_STATES {
            return Err(CallInputError::BadTransMatrix(s.to_string()));
        }
        for (j, v) in values.into_iter().enumerate() {
            m[[i, j]] = v;
        }
    }
    Ok(m)
}

struct CountsInput {
    exons: Vec<Exon>,
    sample_ids: Vec<String>,
    matrix: ndarray::Array2<f64>,
}

/// Read the `chrom, start, end, exonID, <sample>...` normalized count
/// matrix (spec §6 `exons` + `countsNorm`).
fn read_counts(path: &str) -> Result<CountsInput, CallInputError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_path(path)?;

    let header = reader.headers()?.clone();
    if header.len() < 5 {
        return Err(CallInputError::MissingHeader);
    }
    if &header[0] != "chrom" || &header[1] != "start" || &header[2] != "end" || &header[3] != "exonID" {
        return Err(CallInputError::BadHeader);
    }
    let sample_ids: Vec<String> = header.iter().skip(4).map(|s| s.to_string()).collect();

    let mut exons = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for record in reader.records() {
        let record = record?;
        let chrom = record[0].to_string();
        let start: u64 = record[1].parse()?;
        let end: u64 = record[2].parse()?;
        let exon_id = record[3].to_string();
        exons.push(Exon::new(chrom, start, end, exon_id));

        let row: Vec<f64> = record.iter().skip(4).map(|v| v.parse::<f64>()).collect::<Result<_, _>>()?;
        rows.push(row);
    }

    let num_exons = exons.len();
    let num_samples = sample_ids.len();
    let mut matrix = ndarray::Array2::<f64>::zeros((num_exons, num_samples));
    for (e, row) in rows.into_iter().enumerate() {
        for (s, v) in row.into_iter().enumerate() {
            matrix[[e, s]] = v;
        }
    }

    Ok(CountsInput {
        exons,
        sample_ids,
        matrix,
    })
}

/// Read cluster membership (spec §3 `clusterSamples`, `clusterControls`,
/// `clusterType`): one row per `(cluster_id, sample_id)` pair.
fn read_clusters(path: &str, sample_ids: &[String]) -> Result<Vec<Cluster>, CallInputError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_path(path)?;

    let sample_index: HashMap<&str, usize> =
        sample_ids.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();

    let mut by_id: indexmap::IndexMap<String, Cluster> = indexmap::IndexMap::new();
    for record in reader.records() {
        let record = record?;
        let cluster_id = record[0].to_string();
        let cluster_type = match &record[1] {
            "A" => ClusterType::Autosomal,
            "G" => ClusterType::Gonosomal,
            other => return Err(CallInputError::BadClusterType(other.to_string())),
        };
        let sample_id = record[2].to_string();
        let sample_idx = *sample_index
            .get(sample_id.as_str())
            .ok_or_else(|| CallInputError::UnknownSample(cluster_id.clone(), sample_id.clone()))?;
        let controls: Vec<String> = record[3]
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        let entry = by_id.entry(cluster_id.clone()).or_insert_with(|| Cluster {
            id: cluster_id.clone(),
            cluster_type,
            samples: Vec::new(),
            controls: Vec::new(),
        });
        entry.samples.push(sample_idx);
        for c in controls {
            if !entry.controls.contains(&c) {
                entry.controls.push(c);
            }
        }
    }

    Ok(by_id.into_values().collect())
}

fn write_likelihoods(
    path: &str,
    likelihoods: &orchestrator::EmissionTensor,
    sample_ids: &[String],
) -> Result<(), CallInputError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "exon_idx\tsample_id\tcn0\tcn1\tcn2\tcn3")?;
    for e in 0..likelihoods.nrows() {
        for (s, sample_id) in sample_ids.iter().enumerate() {
            let base = s * NUM_STATES;
            if likelihoods[[e, base]] == crate::cnv::types::NO_CALL {
                continue;
            }
            writeln!(
                w,
                "{e}\t{sample_id}\t{}\t{}\t{}\t{}",
                likelihoods[[e, base]],
                likelihoods[[e, base + 1]],
                likelihoods[[e, base + 2]],
                likelihoods[[e, base + 3]],
            )?;
        }
    }
    Ok(())
}

fn write_cnvs(path: &str, cnvs: &[crate::cnv::types::Cnv]) -> Result<(), CallInputError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "sample_id\tcn_state\tfirst_exon_idx\tlast_exon_idx\tquality_score")?;
    for cnv in cnvs {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{}",
            cnv.sample_id, cnv.cn_state, cnv.first_exon_idx, cnv.last_exon_idx, cnv.quality_score
        )?;
    }
    Ok(())
}

fn split_exon_lists(exons: &[Exon]) -> (Vec<usize>, Vec<usize>) {
    const GONOSOMES: [&str; 4] = ["chrX", "chrY", "X", "Y"];
    let mut autosomal = Vec::new();
    let mut gonosomal = Vec::new();
    for (i, exon) in exons.iter().enumerate() {
        if GONOSOMES.contains(&exon.chrom.as_str()) {
            gonosomal.push(i);
        } else {
            autosomal.push(i);
        }
    }
    (autosomal, gonosomal)
}

/// Main entry point for `cnv call`.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:#?}", &args_common);
    tracing::info!("args = {:#?}", &args);

    if let Some(jobs) = args.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()
            .map_err(|e| anyhow::anyhow!("building global Rayon thread pool failed: {}", e))?;
    }

    crate::common::trace_rss_now();

    let priors = parse_priors(&args.priors)?;
    let trans_matrix = parse_trans_matrix(&args.trans_matrix)?;

    tracing::info!("reading counts from {}", &args.counts);
    let counts = read_counts(&args.counts)?;
    tracing::info!("reading clusters from {}", &args.clusters);
    let clusters = read_clusters(&args.clusters, &counts.sample_ids)?;

    let (autosomal_exons, gonosomal_exons) = split_exon_lists(&counts.exons);
    tracing::info!(
        num_exons = counts.exons.len(),
        num_autosomal = autosomal_exons.len(),
        num_gonosomal = gonosomal_exons.len(),
        num_samples = counts.sample_ids.len(),
        num_clusters = clusters.len(),
        "starting CNV calling"
    );

    let params = match &args.params {
        Some(path) => {
            tracing::info!("loading call parameters from {}", path);
            let file = File::open(path)?;
            serde_json::from_reader(file)
                .map_err(|e| anyhow::anyhow!("parsing call parameters from {}: {}", path, e))?
        }
        None => CallParams {
            bandwidth_rule: args.kde_bandwidth_mode.into(),
            cn3_model: args.cn3_model.into(),
            transition_power: args.transition_power,
            quality_log_base: args.quality_log_base.into(),
            dmax: args.dmax,
        },
    };

    let outcome = orchestrator::run(
        &clusters,
        &counts.exons,
        &autosomal_exons,
        &gonosomal_exons,
        &counts.matrix,
        &counts.sample_ids,
        &priors,
        &trans_matrix,
        &params,
    )?;

    for failure in &outcome.failures {
        tracing::error!(sample = %failure.sample_id, cause = %failure.cause, "sample decode failure");
    }

    tracing::info!("writing likelihoods to {}", &args.out_likelihoods);
    write_likelihoods(&args.out_likelihoods, &outcome.likelihoods, &counts.sample_ids)?;
    tracing::info!("writing CNVs to {}", &args.out_cnvs);
    write_cnvs(&args.out_cnvs, &outcome.cnvs)?;

    tracing::info!(
        num_cnvs = outcome.cnvs.len(),
        num_failures = outcome.failures.len(),
        "done"
    );

    Ok(())
}
