use std::{fmt, ops::Not};

use log::{debug, warn};
use serde::Serialize;

use crate::sparse::CsrMatrix;

/// Percentile of the scores of each length bin above which hits are used to fit the model, so
/// only the top 5% of every bin is kept.
const TOP_PERCENTILE: f64 = 95.;

/// Below this number of hits the scores are not binned and all of them are used for fitting.
const MIN_HITS_FOR_BINNING: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Normalization {
    /// Fits `log10(score) = a·log10(len_q·len_t) + b` on the best hits and divides it out
    LengthFit,

    /// Divides each score by the geometric mean of the two sequence lengths
    SqrtLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FitParameters {
    pub slope: f64,
    pub intercept: f64,
}

/// What happened while normalizing a single pair of species.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Status {
    Fitted(FitParameters),
    FixedExponent,
    NoHits,
    TooFewHits,
    EmptySelfSearch,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fitted(FitParameters { slope, intercept }) => {
                write!(f, "fitted (a={slope:.4}, b={intercept:.4})")
            }
            Self::FixedExponent => f.write_str("fixed exponent"),
            Self::NoHits => f.write_str("no hits"),
            Self::TooFewHits => f.write_str("too few hits"),
            Self::EmptySelfSearch => f.write_str("empty self search"),
        }
    }
}

/// External ids of the query and target species of a score matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeciesPair {
    pub query: usize,
    pub target: usize,
}

impl SpeciesPair {
    #[inline]
    pub fn is_self(&self) -> bool {
        self.query == self.target
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub matrix: CsrMatrix<f64>,
    pub status: Status,
}

pub fn normalize(
    scores: &CsrMatrix<f64>,
    pair: SpeciesPair,
    query_lengths: &[f64],
    target_lengths: &[f64],
    method: Normalization,
) -> Result<Normalized, Error> {
    if scores.shape() != (query_lengths.len(), target_lengths.len()) {
        return Err(Error::ShapeMismatch {
            query: pair.query,
            target: pair.target,
            matrix: scores.shape(),
            lengths: (query_lengths.len(), target_lengths.len()),
        });
    }

    let normalized = match method {
        Normalization::LengthFit => {
            normalize_by_fitted_length(scores, pair, query_lengths, target_lengths)
        }
        Normalization::SqrtLength => {
            normalize_by_sqrt_length(scores, query_lengths, target_lengths)
        }
    };

    Ok(normalized)
}

fn normalize_by_fitted_length(
    scores: &CsrMatrix<f64>,
    pair: SpeciesPair,
    query_lengths: &[f64],
    target_lengths: &[f64],
) -> Normalized {
    let (length_products, hit_scores) = length_products(scores, query_lengths, target_lengths);
    let (top_lengths, top_scores) =
        top_percentile_of_scores(&length_products, &hit_scores, TOP_PERCENTILE);

    if top_scores.len() > 1 {
        let parameters = fit_log_linear(&top_lengths, &top_scores);
        debug!(
            "Species {} vs {}: fitted a={:.5} b={:.5} on {} of {} hits",
            pair.query,
            pair.target,
            parameters.slope,
            parameters.intercept,
            top_scores.len(),
            hit_scores.len(),
        );

        let matrix = scale_by_lengths(
            scores,
            query_lengths,
            target_lengths,
            parameters.slope,
            10f64.powf(-parameters.intercept),
        );
        return Normalized {
            matrix,
            status: Status::Fitted(parameters),
        };
    }

    let status = if pair.is_self() && scores.nnz() == 0 {
        warn!(
            "This is uncommon: there are zero hits when searching the genes of species {} against \
             themselves. Check that the input proteome contains all the genes of that species and \
             that the search program is working",
            pair.query,
        );
        Status::EmptySelfSearch
    } else {
        warn!(
            "Too few hits between species {} and species {} to normalise the scores, these hits \
             will be ignored",
            pair.query, pair.target,
        );
        Status::TooFewHits
    };

    Normalized {
        matrix: CsrMatrix::zeros(scores.rows(), scores.cols()),
        status,
    }
}

fn normalize_by_sqrt_length(
    scores: &CsrMatrix<f64>,
    query_lengths: &[f64],
    target_lengths: &[f64],
) -> Normalized {
    if scores.nnz() == 0 {
        return Normalized {
            matrix: scores.clone(),
            status: Status::NoHits,
        };
    }

    Normalized {
        matrix: scale_by_lengths(scores, query_lengths, target_lengths, 0.5, 1.),
        status: Status::FixedExponent,
    }
}

/// Multiplies every score by `factor · len_q^-exponent · len_t^-exponent`.
fn scale_by_lengths(
    scores: &CsrMatrix<f64>,
    query_lengths: &[f64],
    target_lengths: &[f64],
    exponent: f64,
    factor: f64,
) -> CsrMatrix<f64> {
    let query_factors: Vec<_> = query_lengths.iter().map(|len| len.powf(-exponent)).collect();
    let target_factors: Vec<_> = target_lengths.iter().map(|len| len.powf(-exponent)).collect();
    scores.scale(&query_factors, &target_factors, factor)
}

/// Returns the product of the sequence lengths and the score of every positive hit, in storage
/// order.
fn length_products(
    scores: &CsrMatrix<f64>,
    query_lengths: &[f64],
    target_lengths: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    scores
        .iter()
        .filter(|&(_, _, &score)| score > 0.)
        .map(|(query, target, &score)| (query_lengths[query] * target_lengths[target], score))
        .unzip()
}

/// Sorts the hits by length product, splits them into bins of equal size and keeps, for each bin,
/// the scores at or above the given percentile. The trailing incomplete bin is discarded.
fn top_percentile_of_scores(
    lengths: &[f64],
    scores: &[f64],
    percentile_to_keep: f64,
) -> (Vec<f64>, Vec<f64>) {
    let hits = scores.len();
    let mut order: Vec<usize> = (0..hits).collect();
    order.sort_by(|&a, &b| lengths[a].total_cmp(&lengths[b]));
    let sorted_lengths: Vec<_> = order.iter().map(|&index| lengths[index]).collect();
    let sorted_scores: Vec<_> = order.iter().map(|&index| scores[index]).collect();

    if hits < MIN_HITS_FOR_BINNING {
        return (sorted_lengths, sorted_scores);
    }

    let bin_size = if hits > 5000 {
        1000
    } else if hits > 1000 {
        200
    } else {
        20
    };

    let mut top_lengths = Vec::new();
    let mut top_scores = Vec::new();
    let mut bin_buffer = Vec::with_capacity(bin_size);
    for (bin_lengths, bin_scores) in sorted_lengths
        .chunks_exact(bin_size)
        .zip(sorted_scores.chunks_exact(bin_size))
    {
        bin_buffer.clear();
        bin_buffer.extend_from_slice(bin_scores);
        let cutoff = percentile(&mut bin_buffer, percentile_to_keep);

        for (&len, &score) in bin_lengths.iter().zip(bin_scores) {
            if score >= cutoff {
                top_lengths.push(len);
                top_scores.push(score);
            }
        }
    }

    (top_lengths, top_scores)
}

/// Least-squares fit of `log10(score) = slope · log10(length) + intercept`.
///
/// When all the lengths are the same the slope cannot be determined: it is set to zero and the
/// intercept is the mean of the log-scores.
fn fit_log_linear(lengths: &[f64], scores: &[f64]) -> FitParameters {
    debug_assert_eq!(lengths.len(), scores.len());
    debug_assert!(lengths.is_empty().not());

    #[allow(clippy::cast_precision_loss)]
    let len = lengths.len() as f64;
    let xs = lengths.iter().map(|length| length.log10());
    let ys = scores.iter().map(|score| score.log10());

    let mean_x = xs.clone().sum::<f64>() / len;
    let mean_y = ys.clone().sum::<f64>() / len;
    let (sxx, sxy) = xs.zip(ys).fold((0., 0.), |(sxx, sxy), (x, y)| {
        let dx = x - mean_x;
        (sxx + dx * dx, sxy + dx * (y - mean_y))
    });

    if sxx <= f64::EPSILON * len {
        return FitParameters {
            slope: 0.,
            intercept: mean_y,
        };
    }

    let slope = sxy / sxx;
    FitParameters {
        slope,
        intercept: mean_y - slope * mean_x,
    }
}

/// Percentile with linear interpolation between the closest ranks. The slice is sorted in place.
pub(crate) fn percentile(values: &mut [f64], percentile: f64) -> f64 {
    assert!(values.is_empty().not());
    values.sort_unstable_by(f64::total_cmp);

    let position = (values.len() - 1) as f64 * percentile / 100.;
    // position is non-negative and lower than the length of the slice
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (lower, upper) = (position.floor() as usize, position.ceil() as usize);
    let lower_value = values[lower];
    lower_value + (values[upper] - lower_value) * (position - lower as f64)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(
        "score matrix of species {query} vs {target} has shape {matrix:?}, but the sequence \
         length tables have shape {lengths:?}"
    )]
    ShapeMismatch {
        query: usize,
        target: usize,
        matrix: (usize, usize),
        lengths: (usize, usize),
    },
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    const CROSS: SpeciesPair = SpeciesPair {
        query: 0,
        target: 1,
    };

    #[test]
    fn percentile_interpolates() {
        let mut values = [4., 1., 3., 2.];
        assert_abs_diff_eq!(percentile(&mut values, 50.), 2.5);
        assert_abs_diff_eq!(percentile(&mut values, 0.), 1.);
        assert_abs_diff_eq!(percentile(&mut values, 100.), 4.);
        assert_abs_diff_eq!(percentile(&mut values, 10.), 1.3);
    }

    #[test]
    fn few_hits_are_fitted_without_binning() {
        // 50 hits lying exactly on log10(s) = 0.8·log10(L) - 1
        let (lengths, scores): (Vec<_>, Vec<_>) = (1..=50)
            .map(|index| {
                let length = f64::from(index * 37 % 50 + 1) * 1000.;
                (length, 10f64.powf(0.8 * length.log10() - 1.))
            })
            .unzip();

        let (kept_lengths, kept_scores) = top_percentile_of_scores(&lengths, &scores, 95.);
        assert_eq!(kept_scores.len(), 50);
        assert!(kept_lengths.windows(2).all(|pair| pair[0] <= pair[1]));

        let first = fit_log_linear(&kept_lengths, &kept_scores);
        let second = fit_log_linear(&kept_lengths, &kept_scores);
        assert_eq!(first, second);
        assert_abs_diff_eq!(first.slope, 0.8, epsilon = 1e-9);
        assert_abs_diff_eq!(first.intercept, -1., epsilon = 1e-9);
    }

    #[test]
    fn binning_keeps_top_of_each_complete_bin() {
        let lengths: Vec<_> = (0..150).map(f64::from).collect();
        let scores: Vec<_> = (0..150).map(|index| f64::from(index % 20 + 1)).collect();

        let (kept_lengths, kept_scores) = top_percentile_of_scores(&lengths, &scores, 95.);
        // 7 complete bins of 20 hits, only the best hit of each one is above the 95th percentile
        assert_eq!(kept_scores, [20.; 7]);
        assert_eq!(kept_lengths, [19., 39., 59., 79., 99., 119., 139.]);
    }

    #[test]
    fn constant_lengths_give_flat_model() {
        let parameters = fit_log_linear(&[100., 100., 100.], &[10., 100., 1000.]);
        assert_abs_diff_eq!(parameters.slope, 0.);
        assert_abs_diff_eq!(parameters.intercept, 2.);
    }

    #[test]
    fn zero_matrix_stays_zero() {
        let scores = CsrMatrix::zeros(3, 2);
        let lengths_q = [100., 200., 300.];
        let lengths_t = [50., 60.];

        for method in [Normalization::LengthFit, Normalization::SqrtLength] {
            let normalized = normalize(&scores, CROSS, &lengths_q, &lengths_t, method).unwrap();
            assert_eq!(normalized.matrix.shape(), (3, 2));
            assert_eq!(normalized.matrix.nnz(), 0);
        }

        let self_pair = SpeciesPair {
            query: 2,
            target: 2,
        };
        let scores = CsrMatrix::zeros(3, 3);
        let normalized =
            normalize(&scores, self_pair, &lengths_q, &lengths_q, Normalization::LengthFit)
                .unwrap();
        assert_eq!(normalized.status, Status::EmptySelfSearch);
    }

    #[test]
    fn single_hit_is_ignored_when_fitting() {
        let scores = CsrMatrix::from_triplets(2, 2, [(0, 1, 120.)]).unwrap();
        let normalized =
            normalize(&scores, CROSS, &[100., 100.], &[100., 100.], Normalization::LengthFit)
                .unwrap();

        assert_eq!(normalized.status, Status::TooFewHits);
        assert_eq!(normalized.matrix, CsrMatrix::zeros(2, 2));
    }

    #[test]
    fn fitted_model_is_divided_out() {
        let triplets = (0..10).flat_map(|query| {
            (0..10).map(move |target| {
                let product = f64::from((query + 1) * 100) * f64::from((target + 1) * 10);
                (query as usize, target as usize, 3. * product.powf(0.5))
            })
        });
        let scores = CsrMatrix::from_triplets(10, 10, triplets).unwrap();
        let query_lengths: Vec<_> = (1..=10).map(|x| f64::from(x * 100)).collect();
        let target_lengths: Vec<_> = (1..=10).map(|x| f64::from(x * 10)).collect();

        let normalized = normalize(
            &scores,
            CROSS,
            &query_lengths,
            &target_lengths,
            Normalization::LengthFit,
        )
        .unwrap();

        let Status::Fitted(parameters) = normalized.status else {
            panic!("expected a fitted model");
        };
        assert_abs_diff_eq!(parameters.slope, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(parameters.intercept, 3f64.log10(), epsilon = 1e-9);
        assert_eq!(normalized.matrix.shape(), scores.shape());
        for &value in normalized.matrix.values() {
            assert_abs_diff_eq!(value, 1., epsilon = 1e-9);
        }
    }

    #[test]
    fn sqrt_length_scaling() {
        let scores = CsrMatrix::from_triplets(2, 2, [(0, 1, 100.), (1, 0, 40.)]).unwrap();
        let normalized =
            normalize(&scores, CROSS, &[100., 4.], &[16., 25.], Normalization::SqrtLength)
                .unwrap();

        assert_eq!(normalized.status, Status::FixedExponent);
        assert_abs_diff_eq!(*normalized.matrix.get(0, 1).unwrap(), 2.);
        assert_abs_diff_eq!(*normalized.matrix.get(1, 0).unwrap(), 5.);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let scores = CsrMatrix::zeros(2, 2);
        let err = normalize(&scores, CROSS, &[1.], &[1., 1.], Normalization::LengthFit)
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}
