use std::{
    error::Error as StdError,
    fmt::{self, Display},
    io::{self, Read, Seek, SeekFrom, Write},
};

use crate::sparse::{CsrMatrix, LayoutError};

pub(super) const END_SIZE: u8 = 18;
pub(super) const END_MARKER: &[u8] = b"[eofmat]";
pub(super) const VERSION: u16 = 1;

/// A value type that can be stored in a native matrix record.
pub trait Element: Sized + Copy + Send + Sync + 'static {
    /// Identifies the element type inside a record.
    const KIND: u8;

    fn write_le<W: Write>(self, writer: &mut W) -> io::Result<()>;

    fn read_le<R: Read>(reader: &mut R) -> io::Result<Self>;
}

impl Element for () {
    const KIND: u8 = 0;

    #[inline]
    fn write_le<W: Write>(self, _writer: &mut W) -> io::Result<()> {
        Ok(())
    }

    #[inline]
    fn read_le<R: Read>(_reader: &mut R) -> io::Result<Self> {
        Ok(())
    }
}

impl Element for f64 {
    const KIND: u8 = 1;

    #[inline]
    fn write_le<W: Write>(self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }

    #[inline]
    fn read_le<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buffer = [0; 8];
        reader.read_exact(&mut buffer)?;
        Ok(f64::from_le_bytes(buffer))
    }
}

/// Writes a matrix record: the body (shape, element kind, row pointers, column indices and
/// values) followed by the trailer (number of stored entries, version and end marker).
pub fn write_matrix<W, T>(mut writer: W, matrix: &CsrMatrix<T>) -> Result<(), WriteError>
where
    W: Write,
    T: Element,
{
    let (rows, cols) = matrix.shape();
    writer.write_all(&(rows as u64).to_le_bytes())?;
    writer.write_all(&(cols as u64).to_le_bytes())?;
    writer.write_all(&[T::KIND])?;

    for &offset in matrix.indptr() {
        writer.write_all(&(offset as u64).to_le_bytes())?;
    }
    for &col in matrix.indices() {
        let col = u32::try_from(col).map_err(|_| WriteError::ColumnTooLarge(col))?;
        writer.write_all(&col.to_le_bytes())?;
    }
    for &value in matrix.values() {
        value.write_le(&mut writer)?;
    }

    writer.write_all(&(matrix.nnz() as u64).to_le_bytes())?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(END_MARKER)?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    ColumnTooLarge(usize),
}

impl From<io::Error> for WriteError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Io(_) => f.write_str("unable to write matrix record"),
            WriteError::ColumnTooLarge(col) => {
                write!(f, "column index {col} cannot be represented in a matrix record")
            }
        }
    }
}

impl StdError for WriteError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            WriteError::Io(source) => Some(source),
            WriteError::ColumnTooLarge(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    nnz: u64,
    _version: u16,
    end_offset: u64,
}

impl<R> Reader<R>
where
    R: Read + Seek,
{
    pub fn new(mut reader: R) -> Result<Self, NewReaderError> {
        use NewReaderError as E;

        let end_offset = reader
            .seek(SeekFrom::End(-i64::from(END_SIZE)))
            .map_err(E::SeekToTrailer)?;
        let mut end_buf = [0; END_SIZE as usize];
        reader.read_exact(&mut end_buf).map_err(E::ReadTrailer)?;

        if &end_buf[10..18] != END_MARKER {
            return Err(E::InvalidMarker);
        }

        let nnz = u64::from_le_bytes(end_buf[0..8].try_into().unwrap());
        let version = u16::from_le_bytes(end_buf[8..10].try_into().unwrap());
        if version != VERSION {
            return Err(E::UnsupportedVersion(version));
        }

        Ok(Self {
            inner: reader,
            nnz,
            _version: version,
            end_offset,
        })
    }

    pub fn read_matrix<T>(&mut self) -> Result<CsrMatrix<T>, ReadMatrixError>
    where
        T: Element,
    {
        use ReadMatrixError as E;

        self.inner.seek(SeekFrom::Start(0)).map_err(E::SeekStart)?;

        let rows = read_len(&mut self.inner).map_err(E::ReadShape)?;
        let cols = read_len(&mut self.inner).map_err(E::ReadShape)?;
        let nnz = usize::try_from(self.nnz).map_err(|_| E::TooLarge)?;

        let mut kind = [0; 1];
        self.inner.read_exact(&mut kind).map_err(E::ReadShape)?;
        if kind[0] != T::KIND {
            return Err(E::ElementKind {
                expected: T::KIND,
                found: kind[0],
            });
        }

        let indptr = (0..=rows)
            .map(|_| read_len(&mut self.inner))
            .collect::<Result<Vec<_>, _>>()
            .map_err(E::ReadIndptr)?;

        let indices = (0..nnz)
            .map(|_| {
                let mut buffer = [0; 4];
                self.inner
                    .read_exact(&mut buffer)
                    .map(|()| u32::from_le_bytes(buffer) as usize)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(E::ReadIndices)?;

        let values = (0..nnz)
            .map(|_| T::read_le(&mut self.inner))
            .collect::<Result<Vec<_>, _>>()
            .map_err(E::ReadValues)?;

        let offset = self.inner.stream_position().map_err(E::StreamPosition)?;
        if offset != self.end_offset {
            return Err(E::TrailerMismatch);
        }

        CsrMatrix::from_raw_parts(rows, cols, indptr, indices, values).map_err(E::Layout)
    }
}

fn read_len<R: Read>(reader: &mut R) -> io::Result<usize> {
    let mut buffer = [0; 8];
    reader.read_exact(&mut buffer)?;
    usize::try_from(u64::from_le_bytes(buffer))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length does not fit in usize"))
}

#[derive(Debug)]
pub enum NewReaderError {
    SeekToTrailer(io::Error),
    ReadTrailer(io::Error),
    InvalidMarker,
    UnsupportedVersion(u16),
}

impl Display for NewReaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NewReaderError::SeekToTrailer(_) => f.write_str("unable to seek to record trailer"),
            NewReaderError::ReadTrailer(_) => f.write_str("unable to read record trailer"),
            NewReaderError::InvalidMarker => f.write_str("invalid end of record marker"),
            NewReaderError::UnsupportedVersion(version) => {
                write!(f, "unsupported matrix record version {version}")
            }
        }
    }
}

impl StdError for NewReaderError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            NewReaderError::SeekToTrailer(source) | NewReaderError::ReadTrailer(source) => {
                Some(source)
            }
            NewReaderError::InvalidMarker | NewReaderError::UnsupportedVersion(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum ReadMatrixError {
    SeekStart(io::Error),
    ReadShape(io::Error),
    TooLarge,
    ElementKind { expected: u8, found: u8 },
    ReadIndptr(io::Error),
    ReadIndices(io::Error),
    ReadValues(io::Error),
    StreamPosition(io::Error),
    TrailerMismatch,
    Layout(LayoutError),
}

impl Display for ReadMatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReadMatrixError::SeekStart(_) => "unable to seek to the start of the record",
            ReadMatrixError::ReadShape(_) => "unable to read the matrix header",
            ReadMatrixError::TooLarge => "matrix is too large for the current architecture",
            ReadMatrixError::ElementKind { .. } => "record holds a different element type",
            ReadMatrixError::ReadIndptr(_) => "unable to read row pointers",
            ReadMatrixError::ReadIndices(_) => "unable to read column indices",
            ReadMatrixError::ReadValues(_) => "unable to read values",
            ReadMatrixError::StreamPosition(_) => "unable to get stream position",
            ReadMatrixError::TrailerMismatch => "record body does not end at the trailer",
            ReadMatrixError::Layout(_) => "record does not describe a valid matrix",
        };

        f.write_str(s)
    }
}

impl StdError for ReadMatrixError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ReadMatrixError::SeekStart(source)
            | ReadMatrixError::ReadShape(source)
            | ReadMatrixError::ReadIndptr(source)
            | ReadMatrixError::ReadIndices(source)
            | ReadMatrixError::ReadValues(source)
            | ReadMatrixError::StreamPosition(source) => Some(source),
            ReadMatrixError::Layout(source) => Some(source),
            ReadMatrixError::TooLarge
            | ReadMatrixError::ElementKind { .. }
            | ReadMatrixError::TrailerMismatch => None,
        }
    }
}

#[derive(Debug)]
pub enum Error {
    NewReader(NewReaderError),
    Matrix(ReadMatrixError),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::NewReader(_) => "unable to open matrix record",
            Error::Matrix(_) => "unable to read matrix record",
        };

        f.write_str(s)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::NewReader(source) => Some(source),
            Error::Matrix(source) => Some(source),
        }
    }
}

pub fn read_matrix<R, T>(reader: R) -> Result<CsrMatrix<T>, Error>
where
    R: Read + Seek,
    T: Element,
{
    let mut reader = Reader::new(reader).map_err(Error::NewReader)?;
    reader.read_matrix().map_err(Error::Matrix)
}
