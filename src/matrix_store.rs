pub mod native;

use std::{
    fmt,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Cursor},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use fnv::FnvHashMap;

use crate::sparse::CsrMatrix;

pub use native::Element;

/// The kind of matrices exchanged between the phases of the graph construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Scores,
    BestHits,
    Connectivity,
}

impl Tag {
    pub const ALL: [Tag; 3] = [Tag::Scores, Tag::BestHits, Tag::Connectivity];

    fn file_prefix(self) -> &'static str {
        match self {
            Tag::Scores => "scores",
            Tag::BestHits => "best_hits",
            Tag::Connectivity => "connect",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_prefix())
    }
}

/// Which block of the conceptual global matrix is requested for a species.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// `M(i, j)` for every `j`.
    Row,

    /// `M(j, i)ᵀ` for every `j`, so that it has the same shape as the row block.
    Column,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub tag: Tag,
    pub query: usize,
    pub target: usize,
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.tag, self.query, self.target)
    }
}

/// Keyed storage for the sparse matrices produced by one worker and consumed by another.
///
/// Matrices are addressed by species index (the position in the species set), not by the external
/// species id.
pub trait MatrixStore: Sync {
    fn put_matrix<T: Element>(&self, key: Key, matrix: &CsrMatrix<T>) -> Result<(), StoreError>;

    fn get_matrix<T: Element>(&self, key: Key) -> Result<CsrMatrix<T>, StoreError>;

    fn delete_matrix(&self, key: Key) -> Result<(), StoreError>;

    /// Stores `block[j]` as `M(species, j)`.
    fn put<T: Element>(
        &self,
        tag: Tag,
        species: usize,
        block: &[CsrMatrix<T>],
    ) -> Result<(), StoreError> {
        block.iter().enumerate().try_for_each(|(target, matrix)| {
            self.put_matrix(
                Key {
                    tag,
                    query: species,
                    target,
                },
                matrix,
            )
        })
    }

    fn get<T: Element>(
        &self,
        tag: Tag,
        species: usize,
        orientation: Orientation,
        species_count: usize,
    ) -> Result<Vec<CsrMatrix<T>>, StoreError> {
        (0..species_count)
            .map(|other| match orientation {
                Orientation::Row => self.get_matrix(Key {
                    tag,
                    query: species,
                    target: other,
                }),
                Orientation::Column => self
                    .get_matrix::<T>(Key {
                        tag,
                        query: other,
                        target: species,
                    })
                    .map(|matrix| matrix.transpose()),
            })
            .collect()
    }

    /// Removes every `M(species, j)`. Missing entries are not an error.
    fn delete(&self, tag: Tag, species: usize, species_count: usize) -> Result<(), StoreError> {
        (0..species_count).try_for_each(|target| {
            self.delete_matrix(Key {
                tag,
                query: species,
                target,
            })
        })
    }
}

/// One file per matrix inside a working directory.
#[derive(Debug)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: Key) -> PathBuf {
        self.dir.join(format!("{key}.mat"))
    }
}

impl MatrixStore for DiskStore {
    fn put_matrix<T: Element>(&self, key: Key, matrix: &CsrMatrix<T>) -> Result<(), StoreError> {
        let file =
            File::create(self.path(key)).map_err(|source| StoreError::Io { key, source })?;
        native::write_matrix(BufWriter::new(file), matrix)
            .map_err(|source| StoreError::Write { key, source })
    }

    fn get_matrix<T: Element>(&self, key: Key) -> Result<CsrMatrix<T>, StoreError> {
        let file = match File::open(self.path(key)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(key))
            }
            Err(source) => return Err(StoreError::Io { key, source }),
        };
        native::read_matrix(BufReader::new(file))
            .map_err(|source| StoreError::Corrupted { key, source })
    }

    fn delete_matrix(&self, key: Key) -> Result<(), StoreError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { key, source }),
        }
    }
}

/// Encoded records kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<FnvHashMap<Key, Vec<u8>>>,
}

impl MemoryStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl MatrixStore for MemoryStore {
    fn put_matrix<T: Element>(&self, key: Key, matrix: &CsrMatrix<T>) -> Result<(), StoreError> {
        let mut record = Vec::new();
        native::write_matrix(&mut record, matrix)
            .map_err(|source| StoreError::Write { key, source })?;
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, record);
        Ok(())
    }

    fn get_matrix<T: Element>(&self, key: Key) -> Result<CsrMatrix<T>, StoreError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.get(&key).ok_or(StoreError::Missing(key))?;
        native::read_matrix(Cursor::new(record.as_slice()))
            .map_err(|source| StoreError::Corrupted { key, source })
    }

    fn delete_matrix(&self, key: Key) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Ok(())
    }
}

/// The store selected on the command line.
#[derive(Debug)]
pub enum Store {
    Disk(DiskStore),
    Memory(MemoryStore),
}

impl MatrixStore for Store {
    fn put_matrix<T: Element>(&self, key: Key, matrix: &CsrMatrix<T>) -> Result<(), StoreError> {
        match self {
            Store::Disk(store) => store.put_matrix(key, matrix),
            Store::Memory(store) => store.put_matrix(key, matrix),
        }
    }

    fn get_matrix<T: Element>(&self, key: Key) -> Result<CsrMatrix<T>, StoreError> {
        match self {
            Store::Disk(store) => store.get_matrix(key),
            Store::Memory(store) => store.get_matrix(key),
        }
    }

    fn delete_matrix(&self, key: Key) -> Result<(), StoreError> {
        match self {
            Store::Disk(store) => store.delete_matrix(key),
            Store::Memory(store) => store.delete_matrix(key),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unable to create matrix store directory {}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("I/O error on matrix {key}")]
    Io { key: Key, source: io::Error },

    #[error("unable to store matrix {key}")]
    Write {
        key: Key,
        source: native::WriteError,
    },

    #[error("matrix {key} is corrupted")]
    Corrupted { key: Key, source: native::Error },

    #[error("matrix {0} has not been stored")]
    Missing(Key),
}

#[cfg(test)]
mod tests {
    use crate::sparse::Mask;

    use super::*;

    fn block() -> Vec<CsrMatrix<f64>> {
        vec![
            CsrMatrix::from_triplets(2, 2, [(0, 1, 3.)]).unwrap(),
            CsrMatrix::from_triplets(2, 3, [(1, 2, 5.), (0, 0, 1.)]).unwrap(),
        ]
    }

    fn exercise_store<S: MatrixStore>(store: &S) {
        store.put(Tag::Scores, 0, &block()).unwrap();
        store
            .put(
                Tag::Scores,
                1,
                &[
                    CsrMatrix::from_triplets(3, 2, [(2, 0, 7.)]).unwrap(),
                    CsrMatrix::zeros(3, 3),
                ],
            )
            .unwrap();

        let rows: Vec<CsrMatrix<f64>> = store.get(Tag::Scores, 0, Orientation::Row, 2).unwrap();
        assert_eq!(rows, block());

        let columns: Vec<CsrMatrix<f64>> =
            store.get(Tag::Scores, 0, Orientation::Column, 2).unwrap();
        assert_eq!(columns[0], block()[0].transpose());
        assert_eq!(columns[1].shape(), (2, 3));
        assert_eq!(columns[1].get(0, 2), Some(&7.));

        store.delete(Tag::Scores, 0, 2).unwrap();
        assert!(matches!(
            store.get_matrix::<f64>(Key {
                tag: Tag::Scores,
                query: 0,
                target: 1
            }),
            Err(StoreError::Missing(_))
        ));
        store.delete(Tag::Scores, 0, 2).unwrap();
    }

    #[test]
    fn memory_store() {
        let store = MemoryStore::new();
        exercise_store(&store);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::create(dir.path().join("matrices")).unwrap();
        exercise_store(&store);

        assert!(store.dir().join("scores_1_0.mat").exists());
        assert!(!store.dir().join("scores_0_0.mat").exists());
    }

    #[test]
    fn tags_do_not_collide() {
        let store = MemoryStore::new();
        let mask = Mask::from_triplets(2, 2, [(0, 0, ())]).unwrap();
        store.put(Tag::BestHits, 0, &[mask.clone()]).unwrap();
        store.put(Tag::Connectivity, 0, &[Mask::zeros(2, 2)]).unwrap();

        let best_hits: Vec<Mask> = store.get(Tag::BestHits, 0, Orientation::Row, 1).unwrap();
        assert_eq!(best_hits, [mask]);
        assert!(store
            .get::<f64>(Tag::BestHits, 0, Orientation::Row, 1)
            .is_err());
    }
}
