use std::{ops::Not, path::Path};

use anyhow::Context;
use log::{debug, info};

use crate::{
    best_hits::{self, ThresholdMethod},
    graph::GraphAssembler,
    matrix_store::{MatrixStore, Orientation, Tag},
    normalize::{self, Normalization, SpeciesPair, Status},
    scheduler::{Phase, Scheduler},
    sparse::{CsrMatrix, Mask},
    species::SpeciesSet,
    summary::GraphSummary,
};

/// Provides the raw similarity scores between the genes of two species.
pub trait ScoreSource: Sync {
    /// A `genes(query) × genes(target)` matrix. Species are given as indices into `species`.
    fn raw_scores(
        &self,
        species: &SpeciesSet,
        query: usize,
        target: usize,
    ) -> anyhow::Result<CsrMatrix<f64>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    pub normalization: Normalization,
    pub threshold: ThresholdMethod,
    pub rbh_percentile: f64,
    pub tolerance: f64,

    /// Uses all the available processors when `None`.
    pub threads: Option<usize>,
    pub keep_matrices: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            normalization: Normalization::LengthFit,
            threshold: ThresholdMethod::Direct,
            rbh_percentile: 10.,
            tolerance: 1e-3,
            threads: None,
            keep_matrices: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairReport {
    pub target: usize,
    pub hits: usize,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedSpecies {
    pub pairs: Vec<PairReport>,
    pub best_hits: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedSpecies {
    pub reciprocal_best_hits: usize,
    pub from_orthologs: usize,
    pub fallback: usize,
    pub isolated: usize,
    pub connections: usize,
}

pub struct GraphBuilder<'a, S, M> {
    pub config: &'a GraphConfig,
    pub species: &'a SpeciesSet,
    pub source: &'a S,
    pub store: &'a M,
}

impl<'a, S, M> GraphBuilder<'a, S, M>
where
    S: ScoreSource,
    M: MatrixStore,
{
    /// Normalizes the scores of species `index` against every species and stores them together
    /// with the best hits.
    pub fn process_blast_hits(&self, index: usize) -> anyhow::Result<ProcessedSpecies> {
        let species = self.species;
        let query_id = species.id(index);

        let mut pairs = Vec::with_capacity(species.len());
        let normalized = species
            .indices()
            .map(|target| {
                let raw = self.source.raw_scores(species, index, target)?;
                // stored zeros would otherwise become best hits of genes without any hit
                let raw = raw.intersect(&raw.filter_pattern(|_, _, &score| score > 0.));
                let normalize::Normalized { matrix, status } = normalize::normalize(
                    &raw,
                    SpeciesPair {
                        query: query_id,
                        target: species.id(target),
                    },
                    species.lengths(index),
                    species.lengths(target),
                    self.config.normalization,
                )?;

                pairs.push(PairReport {
                    target: species.id(target),
                    hits: raw.nnz(),
                    status,
                });
                Ok(matrix)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.store
            .put(Tag::Scores, index, &normalized)
            .context("Unable to store normalized scores")?;

        let best_hits = best_hits::best_hits(index, &normalized, self.config.tolerance);
        self.store
            .put(Tag::BestHits, index, &best_hits)
            .context("Unable to store best hits")?;

        info!("Initial processing of species {query_id} complete");
        Ok(ProcessedSpecies {
            pairs,
            best_hits: best_hits.iter().map(Mask::nnz).sum(),
        })
    }

    /// Connects every gene of species `index` with the genes scoring at least as well as its
    /// most distant ortholog. Needs the best hits of every species.
    pub fn connect_cognates(&self, index: usize) -> anyhow::Result<ConnectedSpecies> {
        let species_count = self.species.len();
        let scores: Vec<CsrMatrix<f64>> = self
            .store
            .get(Tag::Scores, index, Orientation::Row, species_count)
            .context("Unable to load normalized scores")?;
        let row_block: Vec<Mask> = self
            .store
            .get(Tag::BestHits, index, Orientation::Row, species_count)
            .context("Unable to load best hits")?;
        let column_block: Vec<Mask> = self
            .store
            .get(Tag::BestHits, index, Orientation::Column, species_count)
            .context("Unable to load best hits of the other species")?;

        let rbh = best_hits::reciprocal_best_hits(index, &row_block, &column_block);
        let thresholds = best_hits::most_distant(
            self.config.threshold,
            index,
            &rbh,
            &scores,
            self.config.rbh_percentile,
        );
        debug!(
            "Species {}: {} thresholds from orthologs, {} fallbacks, {} isolated genes",
            self.species.id(index),
            thresholds.from_orthologs,
            thresholds.fallback,
            thresholds.isolated,
        );

        let connectivity =
            best_hits::connect_all_better_than_cutoff(index, &scores, &thresholds.cutoffs);
        self.store
            .put(Tag::Connectivity, index, &connectivity)
            .context("Unable to store connectivity")?;

        info!(
            "Connected putative homologues for species {}",
            self.species.id(index)
        );
        Ok(ConnectedSpecies {
            reciprocal_best_hits: rbh.iter().flatten().map(Mask::nnz).sum(),
            from_orthologs: thresholds.from_orthologs,
            fallback: thresholds.fallback,
            isolated: thresholds.isolated,
            connections: connectivity.iter().map(Mask::nnz).sum(),
        })
    }

    /// Runs both phases and writes the graph to `graph_path`. Partial graph files are written to
    /// `work_dir`.
    pub fn build(&self, graph_path: &Path, work_dir: &Path) -> anyhow::Result<GraphSummary> {
        let species_count = self.species.len();
        let scheduler = Scheduler::new(self.config.threads, species_count);
        info!(
            "Building the graph of {} species ({} genes) with {} workers",
            species_count,
            self.species.total_genes(),
            scheduler.workers(),
        );

        let processed = scheduler.run_phase(Phase::ProcessBlastHits, species_count, |index| {
            self.process_blast_hits(index)
                .with_context(|| format!("Species {} failed", self.species.id(index)))
        })?;
        info!("Initial processing of all species complete");

        let connected = scheduler.run_phase(Phase::ConnectCognates, species_count, |index| {
            self.connect_cognates(index)
                .with_context(|| format!("Species {} failed", self.species.id(index)))
        })?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(scheduler.workers())
            .build()
            .context("Unable to create thread pool")?;
        let assembler = GraphAssembler {
            store: self.store,
            species: self.species,
            work_dir,
        };
        let edges = assembler
            .assemble(&pool, graph_path)
            .context("Unable to write the graph")?;

        if self.config.keep_matrices.not() {
            assembler
                .cleanup()
                .context("Unable to remove intermediate matrices")?;
        }

        Ok(GraphSummary::new(self.species, processed, connected, edges))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::bail;

    use crate::matrix_store::{DiskStore, MemoryStore};

    use super::*;

    /// Scores indexed by `[query][target]`, zero when not given.
    struct Scores(Vec<Vec<Option<CsrMatrix<f64>>>>);

    impl Scores {
        fn new(species: &SpeciesSet) -> Self {
            Self(vec![vec![None; species.len()]; species.len()])
        }

        fn with(mut self, query: usize, target: usize, matrix: CsrMatrix<f64>) -> Self {
            self.0[query][target] = Some(matrix);
            self
        }
    }

    impl ScoreSource for Scores {
        fn raw_scores(
            &self,
            species: &SpeciesSet,
            query: usize,
            target: usize,
        ) -> anyhow::Result<CsrMatrix<f64>> {
            Ok(self.0[query][target].clone().unwrap_or_else(|| {
                CsrMatrix::zeros(species.gene_count(query), species.gene_count(target))
            }))
        }
    }

    struct Failing;

    impl ScoreSource for Failing {
        fn raw_scores(
            &self,
            species: &SpeciesSet,
            query: usize,
            target: usize,
        ) -> anyhow::Result<CsrMatrix<f64>> {
            if query == 1 {
                bail!("truncated search output");
            }
            Ok(CsrMatrix::zeros(
                species.gene_count(query),
                species.gene_count(target),
            ))
        }
    }

    fn build<S: ScoreSource, M: MatrixStore>(
        config: &GraphConfig,
        species: &SpeciesSet,
        source: &S,
        store: &M,
    ) -> (String, GraphSummary) {
        let dir = tempfile::tempdir().unwrap();
        let graph_path = dir.path().join("graph.txt");
        let summary = GraphBuilder {
            config,
            species,
            source,
            store,
        }
        .build(&graph_path, dir.path())
        .unwrap();

        (fs::read_to_string(graph_path).unwrap(), summary)
    }

    #[test]
    fn single_reciprocal_pair() {
        let species = SpeciesSet::new([(0, vec![100.; 3]), (1, vec![100.; 3])]).unwrap();
        let source = Scores::new(&species)
            .with(0, 1, CsrMatrix::from_triplets(3, 3, [(0, 0, 100.)]).unwrap())
            .with(1, 0, CsrMatrix::from_triplets(3, 3, [(0, 0, 100.)]).unwrap());
        let config = GraphConfig {
            normalization: Normalization::SqrtLength,
            threads: Some(2),
            ..GraphConfig::default()
        };
        let store = MemoryStore::new();

        let (graph, summary) = build(&config, &species, &source, &store);
        assert_eq!(
            graph,
            "(mclheader\nmcltype matrix\ndimensions 6x6\n)\n\n(mclmatrix\nbegin\n\n\
             0    3:1.000 $\n\
             1    $\n\
             2    $\n\
             3    0:1.000 $\n\
             4    $\n\
             5    $\n\
             )\n"
        );
        assert_eq!(store.len(), 0);
        assert_eq!(summary.species[0].isolated_genes, 2);
        assert_eq!(summary.species[1].reciprocal_best_hits, 1);
    }

    #[test]
    fn stored_zero_scores_are_not_hits() {
        let species = SpeciesSet::new([(0, vec![100.; 3]), (1, vec![100.; 3])]).unwrap();
        let dense = |best: Option<f64>| {
            let triplets = (0..3)
                .flat_map(|row| (0..3).map(move |col| (row, col)))
                .map(|(row, col)| {
                    let score = if (row, col) == (0, 0) { best } else { None };
                    (row, col, score.unwrap_or(0.))
                });
            CsrMatrix::from_triplets(3, 3, triplets).unwrap()
        };
        let source = Scores::new(&species)
            .with(0, 0, dense(None))
            .with(0, 1, dense(Some(100.)))
            .with(1, 0, dense(Some(100.)))
            .with(1, 1, dense(None));
        let config = GraphConfig {
            normalization: Normalization::SqrtLength,
            ..GraphConfig::default()
        };
        let store = MemoryStore::new();

        let (graph, summary) = build(&config, &species, &source, &store);
        assert!(graph.contains(":0.000").not());
        assert!(graph.ends_with(
            "begin\n\n0    3:1.000 $\n1    $\n2    $\n3    0:1.000 $\n4    $\n5    $\n)\n"
        ));
        assert_eq!(summary.species[0].best_hits, 1);
        assert_eq!(summary.species[0].isolated_genes, 2);
        assert_eq!(summary.pairs[1].hits, 1);
    }

    #[test]
    fn gene_without_hits_stays_isolated() {
        let species = SpeciesSet::new([(0, vec![100.; 3])]).unwrap();
        let source = Scores::new(&species).with(
            0,
            0,
            CsrMatrix::from_triplets(
                3,
                3,
                [(0, 0, 50.), (0, 1, 30.), (1, 1, 50.), (1, 0, 30.)],
            )
            .unwrap(),
        );
        let config = GraphConfig::default();
        let store = MemoryStore::new();

        let (graph, summary) = build(&config, &species, &source, &store);
        assert!(graph.ends_with("begin\n\n0    1:0.775 $\n1    0:0.775 $\n2    $\n)\n"));
        assert_eq!(summary.species[0].isolated_genes, 1);
        assert_eq!(summary.species[0].edges, 2);
    }

    #[test]
    fn in_paralogs_closer_than_orthologs() {
        // the two genes of species 0 are closer to each other than to the gene of species 1
        let species = SpeciesSet::new([(0, vec![100.; 2]), (1, vec![100.; 1])]).unwrap();
        let source = Scores::new(&species)
            .with(
                0,
                0,
                CsrMatrix::from_triplets(
                    2,
                    2,
                    [(0, 0, 100.), (0, 1, 90.), (1, 0, 90.), (1, 1, 100.)],
                )
                .unwrap(),
            )
            .with(0, 1, CsrMatrix::from_triplets(2, 1, [(0, 0, 60.), (1, 0, 50.)]).unwrap())
            .with(1, 0, CsrMatrix::from_triplets(1, 2, [(0, 0, 60.), (0, 1, 50.)]).unwrap())
            .with(1, 1, CsrMatrix::from_triplets(1, 1, [(0, 0, 100.)]).unwrap());
        let config = GraphConfig {
            normalization: Normalization::SqrtLength,
            ..GraphConfig::default()
        };
        let store = MemoryStore::new();

        let (graph, summary) = build(&config, &species, &source, &store);
        assert!(graph.contains("\n0    1:0.900 2:0.600 $\n"));
        // the weaker ortholog is below the cutoff of both genes
        assert!(graph.contains("\n1    0:0.900 $\n"));
        assert!(graph.contains("\n2    0:0.600 $\n"));
        assert_eq!(summary.species[0].reciprocal_best_hits, 1);
    }

    #[test]
    fn disk_store_is_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::create(dir.path().join("matrices")).unwrap();
        let species = SpeciesSet::new([(0, vec![100.; 2]), (1, vec![80.; 2])]).unwrap();
        let source = Scores::new(&species)
            .with(0, 1, CsrMatrix::from_triplets(2, 2, [(0, 1, 40.)]).unwrap())
            .with(1, 0, CsrMatrix::from_triplets(2, 2, [(1, 0, 40.)]).unwrap());
        let config = GraphConfig {
            normalization: Normalization::SqrtLength,
            threshold: ThresholdMethod::Extrapolated,
            threads: Some(1),
            ..GraphConfig::default()
        };

        let (graph, _) = build(&config, &species, &source, &store);
        assert!(graph.contains("dimensions 4x4"));
        assert!(graph.contains("\n0    3:0.447 $\n"));
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[test]
    fn intermediate_matrices_can_be_kept() {
        let species = SpeciesSet::new([(0, vec![10.; 2])]).unwrap();
        let source = Scores::new(&species);
        let config = GraphConfig {
            keep_matrices: true,
            ..GraphConfig::default()
        };
        let store = MemoryStore::new();

        build(&config, &species, &source, &store);
        assert_eq!(store.len(), Tag::ALL.len());
    }

    #[test]
    fn failing_species_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let species = SpeciesSet::new([(0, vec![10.; 2]), (1, vec![10.; 2])]).unwrap();
        let config = GraphConfig::default();
        let store = MemoryStore::new();

        let err = GraphBuilder {
            config: &config,
            species: &species,
            source: &Failing,
            store: &store,
        }
        .build(&dir.path().join("graph.txt"), dir.path())
        .unwrap_err();

        let err = err.to_string();
        assert!(err.contains("initial processing of hits"));
        assert!(err.contains("failed species: [1]"));
        assert!(!dir.path().join("graph.txt").exists());
    }
}
