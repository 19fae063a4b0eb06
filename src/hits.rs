//! Readers for the run input: one FASTA file per species (`Species{id}.fa`) and one tabular
//! similarity search output per ordered species pair (`Blast{query}_{target}.txt`).

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    ops::Not,
    path::{Path, PathBuf},
};

use anyhow::Context;
use fnv::FnvHashMap;

use crate::{pipeline::ScoreSource, sparse::CsrMatrix, species::SpeciesSet};

const BITSCORE_COLUMN: usize = 11;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to open {}", .path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("I/O error: {0}")]
    IO(#[from] Box<io::Error>),

    #[error("sequence data before the first header at line {0}")]
    SequenceBeforeHeader(usize),

    #[error("invalid gene id at line {} and column {}", .0.row, .0.column)]
    InvalidGeneId(Box<RowColumn>),

    #[error("gene id at line {line} belongs to species {found} instead of {expected}")]
    UnexpectedSpecies {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("gene {gene} is defined more than once (line {line})")]
    DuplicatedGene { line: usize, gene: usize },

    #[error("gene {0} is missing, gene ids must be contiguous and start from 0")]
    MissingGene(usize),

    #[error("line {line} has {found} columns, at least {} expected", BITSCORE_COLUMN + 1)]
    TooFewColumns { line: usize, found: usize },

    #[error("invalid bit score at line {0}, a finite non-negative number is expected")]
    InvalidScore(usize),

    #[error("gene {gene} at line {line} is outside the {genes} known genes of species {species}")]
    GeneOutOfRange {
        line: usize,
        species: usize,
        gene: usize,
        genes: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowColumn {
    pub row: usize,
    pub column: usize,
}

/// Input directory containing the species FASTA files and the search results.
#[derive(Debug, Clone)]
pub struct InputDir {
    dir: PathBuf,
}

impl InputDir {
    #[inline]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn fasta_path(&self, species_id: usize) -> PathBuf {
        self.dir.join(format!("Species{species_id}.fa"))
    }

    pub fn hits_path(&self, query_id: usize, target_id: usize) -> PathBuf {
        self.dir.join(format!("Blast{query_id}_{target_id}.txt"))
    }

    /// Ids of all the `Species{id}.fa` files, sorted.
    pub fn discover_species(&self) -> Result<Vec<usize>, Error> {
        let open_error = |source| Error::Open {
            path: self.dir.clone(),
            source,
        };

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(open_error)? {
            let file_name = entry.map_err(open_error)?.file_name();
            let id = file_name
                .to_str()
                .and_then(|name| name.strip_prefix("Species"))
                .and_then(|name| name.strip_suffix(".fa"))
                .and_then(|id| id.parse::<usize>().ok());
            ids.extend(id);
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn load_species(&self, ids: &[usize]) -> anyhow::Result<SpeciesSet> {
        let species = ids
            .iter()
            .map(|&id| {
                let path = self.fasta_path(id);
                let lengths = read_lengths(&path, id)
                    .with_context(|| format!("Unable to read sequences of species {id}"))?;
                Ok((id, lengths))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        SpeciesSet::new(species).context("Invalid set of species")
    }
}

impl ScoreSource for InputDir {
    fn raw_scores(
        &self,
        species: &SpeciesSet,
        query: usize,
        target: usize,
    ) -> anyhow::Result<CsrMatrix<f64>> {
        let query_id = species.id(query);
        let target_id = species.id(target);
        let path = self.hits_path(query_id, target_id);

        read_hits(
            &path,
            Pair {
                query: (query_id, species.gene_count(query)),
                target: (target_id, species.gene_count(target)),
            },
        )
        .with_context(|| format!("Unable to read hits from {}", path.display()))
    }
}

/// Sequence length of every gene of a species, indexed by gene id.
pub fn read_lengths(path: &Path, species_id: usize) -> Result<Vec<f64>, Error> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    read_lengths_content(BufReader::new(file), species_id)
}

fn read_lengths_content<R: BufRead>(mut reader: R, species_id: usize) -> Result<Vec<f64>, Error> {
    let mut line = String::new();
    let mut lengths: FnvHashMap<usize, usize> = FnvHashMap::default();
    let mut current = None;

    let mut file_row = 0;
    loop {
        line.clear();
        file_row += 1;
        if reader.read_line(&mut line).map_err(Box::new)? == 0 {
            break;
        }

        if let Some(header) = line.strip_prefix('>') {
            let id = header
                .split_ascii_whitespace()
                .next()
                .unwrap_or_default();
            let gene = parse_gene_id(id, species_id, file_row, 2)?;
            if lengths.insert(gene, 0).is_some() {
                return Err(Error::DuplicatedGene {
                    line: file_row,
                    gene,
                });
            }
            current = Some(gene);
        } else {
            let residues = line
                .bytes()
                .filter(|c| c.is_ascii_whitespace().not())
                .count();
            if residues == 0 {
                continue;
            }

            let gene = current.ok_or(Error::SequenceBeforeHeader(file_row))?;
            *lengths.entry(gene).or_default() += residues;
        }
    }

    (0..lengths.len())
        .map(|gene| {
            lengths
                .get(&gene)
                .map(|&len| len as f64)
                .ok_or(Error::MissingGene(gene))
        })
        .collect()
}

/// Species id and gene count of both sides of a search.
#[derive(Debug, Clone, Copy)]
pub struct Pair {
    pub query: (usize, usize),
    pub target: (usize, usize),
}

/// Reads the tabular output of a search as a `query genes × target genes` score matrix. Only the
/// best bit score of repeated pairs is kept.
pub fn read_hits(path: &Path, pair: Pair) -> Result<CsrMatrix<f64>, Error> {
    let file = File::open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    read_hits_content(BufReader::new(file), pair)
}

fn read_hits_content<R: BufRead>(mut reader: R, pair: Pair) -> Result<CsrMatrix<f64>, Error> {
    let Pair {
        query: (query_id, query_genes),
        target: (target_id, target_genes),
    } = pair;

    let mut line = String::new();
    let mut triplets = Vec::new();
    let mut file_row = 0;
    loop {
        line.clear();
        file_row += 1;
        if reader.read_line(&mut line).map_err(Box::new)? == 0 {
            break;
        }

        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<_> = line.split('\t').collect();
        if fields.len() <= BITSCORE_COLUMN {
            return Err(Error::TooFewColumns {
                line: file_row,
                found: fields.len(),
            });
        }

        let query = parse_gene_id(fields[0], query_id, file_row, 1)?;
        let target = parse_gene_id(fields[1], target_id, file_row, 2)?;
        for (gene, species, genes) in [
            (query, query_id, query_genes),
            (target, target_id, target_genes),
        ] {
            if gene >= genes {
                return Err(Error::GeneOutOfRange {
                    line: file_row,
                    species,
                    gene,
                    genes,
                });
            }
        }

        let score = fields[BITSCORE_COLUMN]
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|score| score.is_finite() && *score >= 0.)
            .ok_or(Error::InvalidScore(file_row))?;
        // a zero score is the same as no hit
        if score > 0. {
            triplets.push((query, target, score));
        }
    }

    let matrix = CsrMatrix::from_triplets(query_genes, target_genes, triplets)
        .expect("gene ids have already been checked");
    Ok(matrix)
}

/// Parses a `{species}_{gene}` id.
fn parse_gene_id(raw: &str, species_id: usize, row: usize, column: usize) -> Result<usize, Error> {
    let invalid = || Error::InvalidGeneId(Box::new(RowColumn { row, column }));

    let (species, gene) = raw.trim().split_once('_').ok_or_else(invalid)?;
    let species: usize = species.parse().map_err(|_| invalid())?;
    let gene = gene.parse().map_err(|_| invalid())?;

    if species != species_id {
        return Err(Error::UnexpectedSpecies {
            line: row,
            expected: species_id,
            found: species,
        });
    }
    Ok(gene)
}
