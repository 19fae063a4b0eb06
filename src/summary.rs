use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use anyhow::Context;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use crate::{
    normalize::{FitParameters, Status},
    pipeline::{ConnectedSpecies, ProcessedSpecies},
    species::SpeciesSet,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Tabled)]
pub struct SpeciesSummary {
    #[serde(rename = "Species")]
    #[tabled(rename = "Species")]
    pub species: usize,

    #[serde(rename = "Genes")]
    #[tabled(rename = "Genes")]
    pub genes: usize,

    /// Global id of the first gene
    #[serde(rename = "Offset")]
    #[tabled(rename = "Offset")]
    pub offset: usize,

    #[serde(rename = "BestHits")]
    #[tabled(rename = "Best hits")]
    pub best_hits: usize,

    #[serde(rename = "RBH")]
    #[tabled(rename = "RBH")]
    pub reciprocal_best_hits: usize,

    #[serde(rename = "FallbackCutoffs")]
    #[tabled(rename = "Fallback cutoffs")]
    pub fallback_cutoffs: usize,

    #[serde(rename = "Isolated")]
    #[tabled(rename = "Isolated")]
    pub isolated_genes: usize,

    #[serde(rename = "Connections")]
    #[tabled(rename = "Connections")]
    pub connections: usize,

    #[serde(rename = "Edges")]
    #[tabled(rename = "Edges")]
    pub edges: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Tabled)]
pub struct PairSummary {
    #[serde(rename = "Query")]
    #[tabled(rename = "Query")]
    pub query: usize,

    #[serde(rename = "Target")]
    #[tabled(rename = "Target")]
    pub target: usize,

    #[serde(rename = "Hits")]
    #[tabled(rename = "Hits")]
    pub hits: usize,

    #[serde(rename = "Normalization")]
    #[tabled(rename = "Normalization", display_with = "display_status")]
    pub status: Status,

    #[serde(rename = "Slope")]
    #[tabled(rename = "Slope", display_with = "display_scientific_opt")]
    pub slope: Option<f64>,

    #[serde(rename = "Intercept")]
    #[tabled(rename = "Intercept", display_with = "display_scientific_opt")]
    pub intercept: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSummary {
    pub total_genes: usize,
    pub species: Vec<SpeciesSummary>,
    pub pairs: Vec<PairSummary>,
}

impl GraphSummary {
    /// Per-species results must be ordered by species index.
    pub fn new(
        species: &SpeciesSet,
        processed: Vec<ProcessedSpecies>,
        connected: Vec<ConnectedSpecies>,
        edges: Vec<usize>,
    ) -> Self {
        assert_eq!(processed.len(), species.len());
        assert_eq!(connected.len(), species.len());
        assert_eq!(edges.len(), species.len());

        let mut pairs = Vec::with_capacity(species.len() * species.len());
        let species_summaries = species
            .indices()
            .zip(processed)
            .zip(connected)
            .zip(edges)
            .map(|(((index, processed), connected), edges)| {
                let query = species.id(index);
                pairs.extend(processed.pairs.into_iter().map(|pair| {
                    let (slope, intercept) = match pair.status {
                        Status::Fitted(FitParameters { slope, intercept }) => {
                            (Some(slope), Some(intercept))
                        }
                        _ => (None, None),
                    };

                    PairSummary {
                        query,
                        target: pair.target,
                        hits: pair.hits,
                        status: pair.status,
                        slope,
                        intercept,
                    }
                }));

                SpeciesSummary {
                    species: query,
                    genes: species.gene_count(index),
                    offset: species.offset(index),
                    best_hits: processed.best_hits,
                    reciprocal_best_hits: connected.reciprocal_best_hits,
                    fallback_cutoffs: connected.fallback,
                    isolated_genes: connected.isolated,
                    connections: connected.connections,
                    edges,
                }
            })
            .collect();

        Self {
            total_genes: species.total_genes(),
            species: species_summaries,
            pairs,
        }
    }

    pub fn species_table(&self) -> Table {
        let mut table = Table::new(&self.species);
        table.with(Style::modern());
        table
    }

    pub fn pairs_table(&self) -> Table {
        let mut table = Table::new(&self.pairs);
        table.with(Style::modern());
        table
    }

    /// Species rows as tab-separated values.
    pub fn write_tsv<W: Write>(&self, writer: W) -> csv::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(writer);
        for row in &self.species {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_json<W: Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, self)
    }

    /// Writes `summary.tsv` and `summary.json` into `dir`.
    pub fn write_files(&self, dir: &Path) -> anyhow::Result<()> {
        let tsv = File::create(dir.join("summary.tsv")).context("Unable to create summary TSV")?;
        self.write_tsv(BufWriter::new(tsv))
            .context("Unable to write summary TSV")?;

        let json =
            File::create(dir.join("summary.json")).context("Unable to create summary JSON")?;
        let mut json = BufWriter::new(json);
        self.write_json(&mut json)
            .context("Unable to write summary JSON")?;
        json.flush().context("Unable to write summary JSON")?;

        Ok(())
    }
}

fn display_status(status: &Status) -> String {
    match status {
        Status::Fitted(_) => "fitted".to_string(),
        status => status.to_string(),
    }
}

fn display_scientific(x: f64) -> String {
    if x.abs() >= 0.1 || x == 0. {
        format!("{x:.3}")
    } else {
        format!("{x:.3e}")
    }
}

#[allow(clippy::ref_option)]
fn display_scientific_opt(x: &Option<f64>) -> String {
    x.map(display_scientific).unwrap_or_default()
}
