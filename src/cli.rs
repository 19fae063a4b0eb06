use clap::{ArgAction, Args, Parser, ValueEnum};
use log::LevelFilter;
use std::{fmt, num::ParseFloatError, path::PathBuf, str::FromStr};

use crate::{best_hits::ThresholdMethod, normalize::Normalization, pipeline::GraphConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
/// Builds the gene similarity graph used to infer orthogroups
pub struct Cli {
    /// Directory containing one `Species<id>.fa` FASTA file per species and one
    /// `Blast<query>_<target>.txt` tabular search output per ordered species pair
    #[arg(short, long)]
    pub input: PathBuf,

    /// Comma-separated ids of the species to use, in order
    ///
    /// Uses every `Species<id>.fa` file of the input directory if not specified, sorted by id
    #[arg(long, value_delimiter = ',')]
    pub species: Option<Vec<usize>>,

    /// Output directory
    #[arg(short, long, default_value = "orthograph_out/")]
    pub output: PathBuf,

    /// Overwrites the output directory (if the specified path already exists)
    #[arg(long, visible_alias = "ow")]
    pub overwrite: bool,

    /// Number of processors to use
    ///
    /// Uses all available processors if not specified
    #[arg(long)]
    pub threads: Option<u16>,

    /// Increases the verbosity of the log (can be repeated)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only reports errors
    #[arg(short, long)]
    pub quiet: bool,

    #[command(flatten, next_help_heading = "Graph options")]
    pub graph_args: GraphArgs,

    #[command(flatten, next_help_heading = "Intermediate matrices options")]
    pub store_args: StoreArgs,

    #[command(flatten, next_help_heading = "Clustering options")]
    pub clustering_args: ClusteringArgs,
}

#[derive(Debug, Args)]
pub struct GraphArgs {
    /// How raw bit scores are corrected for the length of the sequences
    #[arg(long, value_enum, default_value_t = Normalization::LengthFit)]
    pub normalization: Normalization,

    /// How the score of the most distant ortholog of each gene is determined
    #[arg(long, value_enum, default_value_t = ThresholdMethod::Direct)]
    pub threshold: ThresholdMethod,

    /// Percentile of the score ratios between species used to extrapolate the most distant
    /// ortholog
    ///
    /// Note: only used with `--threshold extrapolated`
    #[arg(long, default_value_t = Percentile(10.))]
    pub rbh_percentile: Percentile,

    /// Two hits are both considered best hits when their normalized scores differ less than this
    /// value
    #[arg(long, default_value_t = 1e-3, value_parser = parse_tolerance)]
    pub tolerance: f64,
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    /// Where the matrices exchanged between the phases are kept
    #[arg(long, value_enum, default_value_t = StoreKind::Disk)]
    pub store: StoreKind,

    /// Does not remove the intermediate matrices at the end of the run
    ///
    /// Note: only useful with `--store disk`, matrices are kept in the `matrices` subdirectory of
    /// the output directory
    #[arg(long)]
    pub keep_matrices: bool,
}

#[derive(Debug, Args)]
pub struct ClusteringArgs {
    /// Path to the MCL executable. When specified, the graph is clustered after being written
    #[arg(long)]
    pub mcl: Option<PathBuf>,

    /// MCL inflation parameter
    #[arg(long, default_value_t = 1.5, requires = "mcl")]
    pub inflation: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreKind {
    Disk,
    Memory,
}

impl Cli {
    pub fn graph_config(&self) -> GraphConfig {
        let GraphArgs {
            normalization,
            threshold,
            rbh_percentile,
            tolerance,
        } = self.graph_args;

        GraphConfig {
            normalization,
            threshold,
            rbh_percentile: rbh_percentile.0,
            tolerance,
            threads: self.threads.map(usize::from),
            keep_matrices: self.store_args.keep_matrices,
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }

        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn parse_tolerance(s: &str) -> Result<f64, String> {
    let tolerance: f64 = s.parse().map_err(|error| format!("invalid tolerance: {error}"))?;
    if tolerance.is_finite() && tolerance > 0. {
        Ok(tolerance)
    } else {
        Err("tolerance must be a finite positive number".to_string())
    }
}

/// A value between 0 and 100.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Percentile(pub f64);

impl fmt::Display for Percentile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsePercentileError {
    Invalid(ParseFloatError),
    OutOfRange,
}

impl FromStr for Percentile {
    type Err = ParsePercentileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s.parse().map_err(ParsePercentileError::Invalid)?;
        if (0. ..=100.).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ParsePercentileError::OutOfRange)
        }
    }
}

impl fmt::Display for ParsePercentileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(error) => write!(f, "invalid percentile: {error}"),
            Self::OutOfRange => f.write_str("percentile must be between 0 and 100"),
        }
    }
}

impl std::error::Error for ParsePercentileError {}
