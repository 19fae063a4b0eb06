use std::ops::{Not, Range};

use itertools::Itertools;

/// The ordered set of species taking part in a run, together with the sequence length of every
/// gene.
///
/// The order is fixed for the whole run: species `i` in this set is "species index `i`" everywhere
/// else, and the global id of a gene is its index plus the number of genes of all the preceding
/// species.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesSet {
    ids: Vec<usize>,
    lengths: Vec<Vec<f64>>,
    offsets: Vec<usize>,
}

impl SpeciesSet {
    /// Creates a new set from `(species id, gene lengths)` pairs.
    pub fn new<I>(species: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (usize, Vec<f64>)>,
    {
        let (ids, lengths): (Vec<_>, Vec<_>) = species.into_iter().unzip();
        if ids.is_empty() {
            return Err(Error::Empty);
        }
        if let Some(&id) = ids.iter().duplicates().next() {
            return Err(Error::DuplicatedSpecies(id));
        }

        for (&id, species_lengths) in ids.iter().zip(&lengths) {
            if let Some(gene) = species_lengths
                .iter()
                .position(|&len| (len > 0.).not())
            {
                return Err(Error::InvalidLength { species: id, gene });
            }
        }

        let offsets = lengths
            .iter()
            .scan(0, |offset, species_lengths| {
                let current = *offset;
                *offset += species_lengths.len();
                Some(current)
            })
            .chain(std::iter::once(lengths.iter().map(Vec::len).sum()))
            .collect();

        Ok(Self {
            ids,
            lengths,
            offsets,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// The external id (the one used in file names) of the species at `index`.
    #[inline]
    pub fn id(&self, index: usize) -> usize {
        self.ids[index]
    }

    #[inline]
    pub fn gene_count(&self, index: usize) -> usize {
        self.lengths[index].len()
    }

    #[inline]
    pub fn lengths(&self, index: usize) -> &[f64] {
        &self.lengths[index]
    }

    #[inline]
    pub fn offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    #[inline]
    pub fn global_ids(&self, index: usize) -> Range<usize> {
        self.offsets[index]..self.offsets[index + 1]
    }

    #[inline]
    pub fn total_genes(&self) -> usize {
        self.offsets[self.ids.len()]
    }

    #[inline]
    pub fn indices(&self) -> Range<usize> {
        0..self.ids.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no species to analyse")]
    Empty,

    #[error("gene {gene} of species {species} does not have a positive sequence length")]
    InvalidLength { species: usize, gene: usize },

    #[error("species {0} is given more than once")]
    DuplicatedSpecies(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_species_order() {
        let set = SpeciesSet::new([(3, vec![10.; 3]), (0, vec![5.; 2]), (7, vec![1.; 4])]).unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.id(1), 0);
        assert_eq!(set.offset(0), 0);
        assert_eq!(set.offset(1), 3);
        assert_eq!(set.offset(2), 5);
        assert_eq!(set.global_ids(2), 5..9);
        assert_eq!(set.total_genes(), 9);
    }

    #[test]
    fn zero_length_gene_is_rejected() {
        let err = SpeciesSet::new([(0, vec![10., 0., 3.])]).unwrap_err();
        assert_eq!(err, Error::InvalidLength { species: 0, gene: 1 });
    }

    #[test]
    fn repeated_species_is_rejected() {
        let err = SpeciesSet::new([(1, vec![10.]), (2, vec![10.]), (1, vec![10.])]).unwrap_err();
        assert_eq!(err, Error::DuplicatedSpecies(1));
    }

    #[test]
    fn empty_set_is_rejected() {
        assert_eq!(SpeciesSet::new([]).unwrap_err(), Error::Empty);
    }
}
