//! Writes the similarity graph in the MCL native matrix format.
//!
//! Every species renders its own rows into a partial file, then the partial files are
//! concatenated in species order between the header and the trailer.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, info};
use rayon::prelude::*;

use crate::{
    matrix_store::{MatrixStore, Orientation, StoreError, Tag},
    sparse::{CsrMatrix, Mask},
    species::SpeciesSet,
};

pub fn write_header<W: Write>(mut writer: W, total_genes: usize) -> io::Result<()> {
    write!(
        writer,
        "(mclheader\nmcltype matrix\ndimensions {total_genes}x{total_genes}\n)\n\n(mclmatrix\nbegin\n\n"
    )
}

pub fn write_trailer<W: Write>(mut writer: W) -> io::Result<()> {
    writer.write_all(b")\n")
}

/// `C(i, j) ∪ C(j, i)ᵀ` for every `j`, given the row and the (already transposed) column blocks
/// of the connectivity of species `i`.
pub fn symmetric_connectivity(row_block: &[Mask], column_block: &[Mask]) -> Vec<Mask> {
    row_block
        .iter()
        .zip(column_block)
        .map(|(row, column)| row.union(column))
        .collect()
}

/// Writes one line for every gene of species `index`: the global id of the gene followed by the
/// `neighbour:weight` pairs of `weights[j]` for every species `j`, in species order.
///
/// Returns the number of written edges.
pub fn render_species<W: Write>(
    mut writer: W,
    species: &SpeciesSet,
    index: usize,
    weights: &[CsrMatrix<f64>],
) -> io::Result<usize> {
    assert_eq!(weights.len(), species.len());

    let mut edges = 0;
    for (gene, global_id) in species.global_ids(index).enumerate() {
        write!(writer, "{global_id}    ")?;
        for (target, matrix) in weights.iter().enumerate() {
            let offset = species.offset(target);
            for (other, weight) in matrix.row(gene).iter() {
                write!(writer, "{}:{weight:.3} ", other + offset)?;
                edges += 1;
            }
        }
        writer.write_all(b"$\n")?;
    }

    Ok(edges)
}

pub struct GraphAssembler<'a, S> {
    pub store: &'a S,
    pub species: &'a SpeciesSet,
    pub work_dir: &'a Path,
}

impl<'a, S: MatrixStore> GraphAssembler<'a, S> {
    /// Renders all the species on `pool`, then writes the graph to `path`. Returns the number of
    /// edges of each species.
    pub fn assemble(&self, pool: &rayon::ThreadPool, path: &Path) -> Result<Vec<usize>, GraphError> {
        let partials = pool.install(|| {
            self.species
                .indices()
                .into_par_iter()
                .map(|index| self.render_partial(index))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let file = File::create(path).map_err(|source| GraphError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        let write_error = |source| GraphError::Write {
            path: path.to_path_buf(),
            source,
        };

        write_header(&mut writer, self.species.total_genes()).map_err(write_error)?;
        let mut edges = Vec::with_capacity(partials.len());
        for (partial_path, species_edges) in partials {
            let partial = File::open(&partial_path).map_err(|source| GraphError::Partial {
                path: partial_path.clone(),
                source,
            })?;
            io::copy(&mut BufReader::new(partial), &mut writer).map_err(write_error)?;
            fs::remove_file(&partial_path).map_err(|source| GraphError::Partial {
                path: partial_path,
                source,
            })?;
            edges.push(species_edges);
        }
        write_trailer(&mut writer).map_err(write_error)?;
        writer.flush().map_err(write_error)?;

        info!("Graph written to {}", path.display());
        Ok(edges)
    }

    fn render_partial(&self, index: usize) -> Result<(PathBuf, usize), GraphError> {
        let species_count = self.species.len();
        let store_error = |source| GraphError::Store {
            species: index,
            source,
        };

        let scores: Vec<CsrMatrix<f64>> = self
            .store
            .get(Tag::Scores, index, Orientation::Row, species_count)
            .map_err(store_error)?;
        let row_block: Vec<Mask> = self
            .store
            .get(Tag::Connectivity, index, Orientation::Row, species_count)
            .map_err(store_error)?;
        let column_block: Vec<Mask> = self
            .store
            .get(Tag::Connectivity, index, Orientation::Column, species_count)
            .map_err(store_error)?;

        let weights: Vec<_> = scores
            .iter()
            .zip(symmetric_connectivity(&row_block, &column_block))
            .map(|(scores, connectivity)| scores.intersect(&connectivity))
            .collect();

        let path = self.work_dir.join(format!("graph_{index}"));
        let partial_error = |source| GraphError::Partial {
            path: path.clone(),
            source,
        };
        let mut writer = BufWriter::new(File::create(&path).map_err(partial_error)?);
        let edges =
            render_species(&mut writer, self.species, index, &weights).map_err(partial_error)?;
        writer.flush().map_err(partial_error)?;

        debug!("Rendered {edges} edges for species {index}");
        Ok((path, edges))
    }

    /// Removes every matrix of every tag from the store.
    pub fn cleanup(&self) -> Result<(), StoreError> {
        let species_count = self.species.len();
        for tag in Tag::ALL {
            for index in self.species.indices() {
                self.store.delete(tag, index, species_count)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unable to read matrices of species {species}")]
    Store { species: usize, source: StoreError },

    #[error("unable to handle partial graph file {}", path.display())]
    Partial { path: PathBuf, source: io::Error },

    #[error("unable to create graph file {}", path.display())]
    Create { path: PathBuf, source: io::Error },

    #[error("unable to write graph file {}", path.display())]
    Write { path: PathBuf, source: io::Error },
}
