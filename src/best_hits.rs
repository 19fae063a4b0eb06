//! Best hits, reciprocal best hits and the "connect everything scoring at least as well as the
//! most distant ortholog" rule.
//!
//! Every function works on the row block of a single query species `i`: `scores[j]` is the
//! normalized matrix `B(i, j)`, with the genes of `i` on the rows.

use std::ops::Not;

use serde::Serialize;

use crate::{
    normalize::percentile,
    sparse::{CsrMatrix, Mask},
};

/// Added to the best cross-species score of genes without any reciprocal best hit, so that they
/// only connect to genes of their own species that are closer than any other species.
pub const FALLBACK_OFFSET: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThresholdMethod {
    /// The lowest score among the reciprocal best hits of the gene
    Direct,

    /// Extrapolates the score of the most diverged ortholog from the ratios of reciprocal best
    /// hit scores between pairs of species
    Extrapolated,
}

/// Highest normalized score of every gene of `species` against any *other* species, `None` when
/// the gene has no cross-species hit.
pub fn best_cross_species_scores(species: usize, scores: &[CsrMatrix<f64>]) -> Vec<Option<f64>> {
    let genes = scores[species].rows();
    let mut best = vec![None; genes];
    for (_, matrix) in scores
        .iter()
        .enumerate()
        .filter(|&(target, _)| target != species)
    {
        for (gene, best) in best.iter_mut().enumerate() {
            if let Some(row_max) = matrix.row_max(gene) {
                *best = Some(best.map_or(row_max, |current: f64| current.max(row_max)));
            }
        }
    }
    best
}

/// For every gene, marks as best hits all the targets whose score is within `tolerance` of the
/// row maximum. Within-species hits are only marked when they beat the best cross-species score
/// (minus `tolerance`); genes without any cross-species hit keep all their within-species hits.
pub fn best_hits(species: usize, scores: &[CsrMatrix<f64>], tolerance: f64) -> Vec<Mask> {
    let best_cross = best_cross_species_scores(species, scores);

    scores
        .iter()
        .enumerate()
        .map(|(target, matrix)| {
            if target == species {
                matrix.filter_pattern(|gene, _, &score| {
                    best_cross[gene].map_or(true, |best| score > best - tolerance)
                })
            } else {
                let row_max: Vec<_> = (0..matrix.rows()).map(|gene| matrix.row_max(gene)).collect();
                matrix.filter_pattern(|gene, _, &score| {
                    row_max[gene].map_or(false, |max| score > max - tolerance)
                })
            }
        })
        .collect()
}

/// Combines `BH(i, j)` with `BH(j, i)ᵀ`: a pair is kept only when each gene is a best hit of the
/// other. `column_block[j]` must already be transposed. The entry for `species` itself is `None`.
pub fn reciprocal_best_hits(
    species: usize,
    row_block: &[Mask],
    column_block: &[Mask],
) -> Vec<Option<Mask>> {
    assert_eq!(row_block.len(), column_block.len());

    row_block
        .iter()
        .zip(column_block)
        .enumerate()
        .map(|(target, (row, column))| (target != species).then(|| row.intersect(column)))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// Minimum score for a hit of each gene to become an edge. `f64::INFINITY` for genes without
    /// any hit at all.
    pub cutoffs: Vec<f64>,
    pub from_orthologs: usize,
    pub fallback: usize,
    pub isolated: usize,
}

pub fn most_distant(
    method: ThresholdMethod,
    species: usize,
    rbh: &[Option<Mask>],
    scores: &[CsrMatrix<f64>],
    rbh_percentile: f64,
) -> Thresholds {
    match method {
        ThresholdMethod::Direct => most_distant_direct(species, rbh, scores),
        ThresholdMethod::Extrapolated => {
            most_distant_extrapolated(species, rbh, scores, rbh_percentile)
        }
    }
}

/// The lowest reciprocal-best-hit score of each gene across all the other species.
pub fn most_distant_direct(
    species: usize,
    rbh: &[Option<Mask>],
    scores: &[CsrMatrix<f64>],
) -> Thresholds {
    let mut most_distant = vec![None; scores[species].rows()];
    for (rbh, matrix) in rbh.iter().zip(scores) {
        let Some(rbh) = rbh else { continue };
        for (gene, _, &score) in matrix.intersect(rbh).iter() {
            lower(&mut most_distant[gene], score);
        }
    }

    with_fallback(species, scores, most_distant)
}

/// Estimates, for each gene, the score that a reciprocal best hit in the most diverged species
/// would have.
///
/// For every ordered pair of other species `(a, b)`, the `rbh_percentile`-th percentile of
/// `score_a / score_b` over the genes having exactly one reciprocal best hit in both is the
/// factor converting a score against `b` into a score against `a`. The smallest factor of each
/// column converts a score against `b` into the expected score of the furthest ortholog.
pub fn most_distant_extrapolated(
    species: usize,
    rbh: &[Option<Mask>],
    scores: &[CsrMatrix<f64>],
    rbh_percentile: f64,
) -> Thresholds {
    let genes = scores[species].rows();
    let others: Vec<_> = rbh
        .iter()
        .zip(scores)
        .filter_map(|(rbh, matrix)| rbh.as_ref().map(|rbh| matrix.intersect(rbh)))
        .collect();

    // Score of the only reciprocal best hit of each gene, zero when there are none or many
    let single_rbh_scores: Vec<Vec<f64>> = others
        .iter()
        .map(|rbh_scores| {
            (0..genes)
                .map(|gene| {
                    let row = rbh_scores.row(gene);
                    if row.len() == 1 {
                        row.values[0]
                    } else {
                        0.
                    }
                })
                .collect()
        })
        .collect();

    let mut ratios = Vec::with_capacity(genes);
    let factors: Vec<f64> = (0..others.len())
        .map(|to| {
            (0..others.len())
                .map(|from| {
                    if from == to {
                        return 1.;
                    }

                    ratios.clear();
                    ratios.extend(
                        single_rbh_scores[from]
                            .iter()
                            .zip(&single_rbh_scores[to])
                            .filter(|&(&num, &den)| num > 0. && den > 0.)
                            .map(|(num, den)| num / den)
                            .filter(|ratio| ratio.is_finite()),
                    );

                    if ratios.is_empty() {
                        1.
                    } else {
                        percentile(&mut ratios, rbh_percentile)
                    }
                })
                .fold(f64::INFINITY, f64::min)
        })
        .collect();

    let mut most_distant = vec![None; genes];
    for (rbh_scores, factor) in others.iter().zip(factors) {
        for (gene, _, &score) in rbh_scores.iter() {
            lower(&mut most_distant[gene], factor * score);
        }
    }

    with_fallback(species, scores, most_distant)
}

#[inline]
fn lower(current: &mut Option<f64>, candidate: f64) {
    *current = Some(current.map_or(candidate, |current| current.min(candidate)));
}

fn with_fallback(
    species: usize,
    scores: &[CsrMatrix<f64>],
    most_distant: Vec<Option<f64>>,
) -> Thresholds {
    let best_cross = best_cross_species_scores(species, scores);

    let mut from_orthologs = 0;
    let mut fallback = 0;
    let mut isolated = 0;
    let cutoffs = most_distant
        .into_iter()
        .enumerate()
        .map(|(gene, most_distant)| match most_distant {
            Some(cutoff) => {
                from_orthologs += 1;
                cutoff
            }
            None if scores.iter().all(|matrix| matrix.row(gene).is_empty()) => {
                isolated += 1;
                f64::INFINITY
            }
            None => {
                fallback += 1;
                best_cross[gene].unwrap_or(0.) + FALLBACK_OFFSET
            }
        })
        .collect();

    Thresholds {
        cutoffs,
        from_orthologs,
        fallback,
        isolated,
    }
}

/// Keeps every hit scoring at least the cutoff of its query gene. Self matches are never kept.
pub fn connect_all_better_than_cutoff(
    species: usize,
    scores: &[CsrMatrix<f64>],
    cutoffs: &[f64],
) -> Vec<Mask> {
    scores
        .iter()
        .enumerate()
        .map(|(target, matrix)| {
            assert_eq!(matrix.rows(), cutoffs.len());
            matrix.filter_pattern(|gene, other, &score| {
                score >= cutoffs[gene] && (target == species && gene == other).not()
            })
        })
        .collect()
}
