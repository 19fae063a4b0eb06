use std::cmp::Ordering;

/// Compressed sparse row matrix.
///
/// Column indices inside each row are strictly increasing. Instances are never mutated in place:
/// every transform returns a new matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    rows: usize,
    cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<T>,
}

/// A 0/1 matrix: only the sparsity pattern is stored.
pub type Mask = CsrMatrix<()>;

impl<T> CsrMatrix<T> {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            indptr: vec![0; rows + 1],
            indices: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_raw_parts(
        rows: usize,
        cols: usize,
        indptr: Vec<usize>,
        indices: Vec<usize>,
        values: Vec<T>,
    ) -> Result<Self, LayoutError> {
        use LayoutError as E;

        if indptr.len() != rows + 1 {
            return Err(E::IndptrLen {
                expected: rows + 1,
                found: indptr.len(),
            });
        }
        if indptr[0] != 0 || indptr[rows] != indices.len() {
            return Err(E::IndptrBounds);
        }
        if indices.len() != values.len() {
            return Err(E::ValuesLen {
                indices: indices.len(),
                values: values.len(),
            });
        }

        for (row, bounds) in indptr.windows(2).enumerate() {
            let &[start, end] = bounds else {
                unreachable!()
            };
            if start > end {
                return Err(E::IndptrBounds);
            }

            let row_indices = &indices[start..end];
            if row_indices.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(E::UnsortedRow(row));
            }
            if row_indices.last().map_or(false, |&col| col >= cols) {
                return Err(E::ColumnOutOfBounds { row });
            }
        }

        Ok(Self {
            rows,
            cols,
            indptr,
            indices,
            values,
        })
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    #[inline]
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    #[inline]
    pub fn values(&self) -> &[T] {
        &self.values
    }

    #[inline]
    pub fn row(&self, row: usize) -> RowView<'_, T> {
        let range = self.indptr[row]..self.indptr[row + 1];
        RowView {
            indices: &self.indices[range.clone()],
            values: &self.values[range],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> + '_ {
        (0..self.rows).flat_map(move |row| {
            self.row(row)
                .iter()
                .map(move |(col, value)| (row, col, value))
        })
    }

    #[cfg(test)]
    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        let view = self.row(row);
        view.indices
            .binary_search(&col)
            .ok()
            .map(|index| &view.values[index])
    }

    /// Keeps the entries for which `keep` returns true, dropping the values.
    pub fn filter_pattern<F>(&self, mut keep: F) -> Mask
    where
        F: FnMut(usize, usize, &T) -> bool,
    {
        let mut indptr = Vec::with_capacity(self.rows + 1);
        let mut indices = Vec::new();
        indptr.push(0);
        for row in 0..self.rows {
            indices.extend(
                self.row(row)
                    .iter()
                    .filter(|&(col, value)| keep(row, col, value))
                    .map(|(col, _)| col),
            );
            indptr.push(indices.len());
        }

        let values = vec![(); indices.len()];
        CsrMatrix {
            rows: self.rows,
            cols: self.cols,
            indptr,
            indices,
            values,
        }
    }

    /// Elementwise product with a 0/1 matrix: keeps the values of `self` where `mask` is set.
    pub fn intersect<U>(&self, mask: &CsrMatrix<U>) -> Self
    where
        T: Clone,
    {
        assert_eq!(self.shape(), mask.shape());

        let mut indptr = Vec::with_capacity(self.rows + 1);
        let mut indices = Vec::new();
        let mut values = Vec::new();
        indptr.push(0);
        for row in 0..self.rows {
            let ours = self.row(row);
            let theirs = mask.row(row).indices;
            let (mut a, mut b) = (0, 0);
            while a < ours.indices.len() && b < theirs.len() {
                match ours.indices[a].cmp(&theirs[b]) {
                    Ordering::Less => a += 1,
                    Ordering::Greater => b += 1,
                    Ordering::Equal => {
                        indices.push(ours.indices[a]);
                        values.push(ours.values[a].clone());
                        a += 1;
                        b += 1;
                    }
                }
            }
            indptr.push(indices.len());
        }

        Self {
            rows: self.rows,
            cols: self.cols,
            indptr,
            indices,
            values,
        }
    }

    pub fn transpose(&self) -> Self
    where
        T: Clone,
    {
        let mut counts = vec![0usize; self.cols + 1];
        for &col in &self.indices {
            counts[col + 1] += 1;
        }
        for col in 0..self.cols {
            counts[col + 1] += counts[col];
        }
        let indptr = counts.clone();

        let mut slots: Vec<Option<(usize, T)>> = vec![None; self.nnz()];
        let mut next = counts;
        for (row, col, value) in self.iter() {
            slots[next[col]] = Some((row, value.clone()));
            next[col] += 1;
        }

        let (indices, values) = slots
            .into_iter()
            .map(|slot| slot.expect("every transposed slot is filled exactly once"))
            .unzip();

        Self {
            rows: self.cols,
            cols: self.rows,
            indptr,
            indices,
            values,
        }
    }
}

impl<T> CsrMatrix<T>
where
    T: Copy + PartialOrd,
{
    /// Builds a matrix from unordered `(row, col, value)` triplets. Duplicated positions keep the
    /// greatest value.
    pub fn from_triplets<I>(rows: usize, cols: usize, triplets: I) -> Result<Self, LayoutError>
    where
        I: IntoIterator<Item = (usize, usize, T)>,
    {
        let mut triplets: Vec<_> = triplets.into_iter().collect();
        if let Some(&(row, col, _)) = triplets
            .iter()
            .find(|&&(row, col, _)| row >= rows || col >= cols)
        {
            return Err(LayoutError::TripletOutOfBounds {
                row,
                col,
                rows,
                cols,
            });
        }
        triplets.sort_unstable_by(|a, b| {
            (a.0, a.1)
                .cmp(&(b.0, b.1))
                .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
        });
        triplets.dedup_by_key(|&mut (row, col, _)| (row, col));

        let mut indptr = vec![0; rows + 1];
        for &(row, _, _) in &triplets {
            indptr[row + 1] += 1;
        }
        for row in 0..rows {
            indptr[row + 1] += indptr[row];
        }

        let (indices, values) = triplets
            .into_iter()
            .map(|(_, col, value)| (col, value))
            .unzip();

        Ok(Self {
            rows,
            cols,
            indptr,
            indices,
            values,
        })
    }
}

impl CsrMatrix<f64> {
    /// Computes `factor · diag(row_factors) · self · diag(col_factors)` in O(nnz).
    pub fn scale(&self, row_factors: &[f64], col_factors: &[f64], factor: f64) -> Self {
        assert_eq!(row_factors.len(), self.rows);
        assert_eq!(col_factors.len(), self.cols);

        let values = (0..self.rows)
            .flat_map(|row| {
                let row_factor = row_factors[row] * factor;
                self.row(row)
                    .iter()
                    .map(move |(col, &value)| value * row_factor * col_factors[col])
            })
            .collect();

        Self {
            rows: self.rows,
            cols: self.cols,
            indptr: self.indptr.clone(),
            indices: self.indices.clone(),
            values,
        }
    }

    #[inline]
    pub fn row_max(&self, row: usize) -> Option<f64> {
        self.row(row).values.iter().copied().reduce(f64::max)
    }
}

impl Mask {
    pub fn union(&self, other: &Mask) -> Mask {
        assert_eq!(self.shape(), other.shape());

        let mut indptr = Vec::with_capacity(self.rows + 1);
        let mut indices = Vec::new();
        indptr.push(0);
        for row in 0..self.rows {
            let ours = self.row(row).indices;
            let theirs = other.row(row).indices;
            let (mut a, mut b) = (0, 0);
            while a < ours.len() || b < theirs.len() {
                let next = match (ours.get(a), theirs.get(b)) {
                    (Some(&x), Some(&y)) => match x.cmp(&y) {
                        Ordering::Less => {
                            a += 1;
                            x
                        }
                        Ordering::Greater => {
                            b += 1;
                            y
                        }
                        Ordering::Equal => {
                            a += 1;
                            b += 1;
                            x
                        }
                    },
                    (Some(&x), None) => {
                        a += 1;
                        x
                    }
                    (None, Some(&y)) => {
                        b += 1;
                        y
                    }
                    (None, None) => unreachable!(),
                };
                indices.push(next);
            }
            indptr.push(indices.len());
        }

        let values = vec![(); indices.len()];
        Mask {
            rows: self.rows,
            cols: self.cols,
            indptr,
            indices,
            values,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RowView<'a, T> {
    pub indices: &'a [usize],
    pub values: &'a [T],
}

impl<'a, T> RowView<'a, T> {
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (usize, &'a T)> + 'a {
        self.indices.iter().copied().zip(self.values)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("row pointer array has length {found}, expected {expected}")]
    IndptrLen { expected: usize, found: usize },

    #[error("row pointer array is not consistent with the number of stored entries")]
    IndptrBounds,

    #[error("{indices} column indices but {values} values")]
    ValuesLen { indices: usize, values: usize },

    #[error("column indices of row {0} are not strictly increasing")]
    UnsortedRow(usize),

    #[error("row {row} has a column index outside the matrix")]
    ColumnOutOfBounds { row: usize },

    #[error("entry ({row}, {col}) is outside a {rows}x{cols} matrix")]
    TripletOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CsrMatrix<f64> {
        CsrMatrix::from_triplets(
            3,
            4,
            [(2, 1, 5.), (0, 3, 1.), (0, 0, 2.), (2, 1, 7.), (1, 2, 3.)],
        )
        .unwrap()
    }

    #[test]
    fn triplets_are_sorted_and_deduplicated() {
        let matrix = sample();

        assert_eq!(matrix.shape(), (3, 4));
        assert_eq!(matrix.indptr(), [0, 2, 3, 4]);
        assert_eq!(matrix.indices(), [0, 3, 2, 1]);
        assert_eq!(matrix.values(), [2., 1., 3., 7.]);
    }

    #[test]
    fn out_of_bounds_triplet() {
        let err = CsrMatrix::from_triplets(2, 2, [(0, 2, 1.)]).unwrap_err();
        assert!(matches!(
            err,
            LayoutError::TripletOutOfBounds { row: 0, col: 2, .. }
        ));
    }

    #[test]
    fn transpose_twice_is_identity() {
        let matrix = sample();
        let transposed = matrix.transpose();

        assert_eq!(transposed.shape(), (4, 3));
        assert_eq!(transposed.get(1, 2), Some(&7.));
        assert_eq!(transposed.get(3, 0), Some(&1.));
        assert_eq!(transposed.get(0, 1), None);
        assert_eq!(transposed.transpose(), matrix);
    }

    #[test]
    fn scale_applies_diagonal_factors() {
        let matrix = sample();
        let scaled = matrix.scale(&[1., 2., 3.], &[1., 10., 100., 1000.], 0.5);

        assert_eq!(scaled.indices(), matrix.indices());
        assert_eq!(scaled.values(), [1., 500., 300., 105.]);
    }

    #[test]
    fn intersect_and_union() {
        let matrix = sample();
        let mask = Mask::from_triplets(3, 4, [(0, 3, ()), (2, 1, ()), (2, 2, ())]).unwrap();

        let kept = matrix.intersect(&mask);
        assert_eq!(kept.values(), [1., 7.]);
        assert_eq!(kept.indptr(), [0, 1, 1, 2]);

        let union = matrix.filter_pattern(|_, _, _| true).union(&mask);
        assert_eq!(union.indptr(), [0, 2, 3, 5]);
        assert_eq!(union.indices(), [0, 3, 2, 1, 2]);
    }

    #[test]
    fn raw_parts_are_validated() {
        let err = CsrMatrix::from_raw_parts(2, 3, vec![0, 2, 2], vec![2, 1], vec![1., 1.])
            .unwrap_err();
        assert_eq!(err, LayoutError::UnsortedRow(0));

        let err =
            CsrMatrix::from_raw_parts(1, 2, vec![0, 1], vec![2], vec![1.]).unwrap_err();
        assert_eq!(err, LayoutError::ColumnOutOfBounds { row: 0 });
    }

    #[test]
    fn row_max_of_empty_row() {
        let matrix = sample();
        assert_eq!(matrix.row_max(0), Some(2.));
        assert_eq!(CsrMatrix::<f64>::zeros(2, 2).row_max(1), None);
    }
}
