/*!
Trace buffers filled row by row while a chain runs.

A buffer is allocated for the full run length up front and, when the run ends
early, truncated to the rows actually written. Two implementations of
[`ResizableArray`] exist:

- [`MemoryBuffer`] keeps the rows in an [`ArrayD`].
- [`MemmapBuffer`] writes the rows to a memory-mapped file so traces of long
  or high-dimensional chains never need to fit in memory.

# On-disk layout

A persisted array is a 64-byte header followed by row-major native-endian
`f64` data:

| bytes  | content                                   |
|--------|-------------------------------------------|
| 0..8   | magic `MHMCARR1`                          |
| 8..16  | number of dimensions, `u64` little-endian |
| 16..64 | up to six dimensions, `u64` little-endian |

Finished files are reopened read-only with [`PersistedArray::open`].
*/

use memmap2::{Mmap, MmapMut};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{McmcError, Result};

pub const HEADER_LEN: usize = 64;
pub const MAGIC: &[u8; 8] = b"MHMCARR1";
/// Maximum number of dimensions of a persisted array, including the row axis.
pub const MAX_NDIM: usize = 6;

const F64_SIZE: usize = std::mem::size_of::<f64>();

/// A row-indexed array that can be cut down to its first rows once filled.
pub trait ResizableArray: Send {
    /// Full shape, `[n_rows, ..row_shape]`.
    fn shape(&self) -> &[usize];

    /// Writes `row` at row `index`.
    fn write_row(&mut self, index: usize, row: ArrayViewD<'_, f64>) -> Result<()>;

    /// Keeps the first `n_rows` rows and releases the buffer.
    fn truncate(self: Box<Self>, n_rows: usize) -> Result<StoredArray>;

    /// Drops the buffer together with any file backing it.
    fn discard(self: Box<Self>) -> Result<()>;
}

/// A finished buffer as handed from a chain back to its driver.
///
/// Persisted arrays travel as paths and are mapped again by the receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredArray {
    InMemory(ArrayD<f64>),
    OnDisk(PathBuf),
}

impl StoredArray {
    pub fn load(self) -> Result<TraceArray> {
        match self {
            StoredArray::InMemory(array) => Ok(TraceArray::Memory(array)),
            StoredArray::OnDisk(path) => Ok(TraceArray::Mapped(PersistedArray::open(path)?)),
        }
    }

    /// Removes the backing file, if any.
    pub fn remove(self) -> Result<()> {
        if let StoredArray::OnDisk(path) = self {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// A recorded trace or statistic of one chain, shape `[n_rows, ..]`.
#[derive(Debug)]
pub enum TraceArray {
    Memory(ArrayD<f64>),
    Mapped(PersistedArray),
}

impl TraceArray {
    pub fn view(&self) -> ArrayViewD<'_, f64> {
        match self {
            TraceArray::Memory(array) => array.view(),
            TraceArray::Mapped(array) => array.view(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TraceArray::Memory(array) => array.shape(),
            TraceArray::Mapped(array) => array.shape(),
        }
    }

    /// Number of recorded rows.
    pub fn len(&self) -> usize {
        self.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file for memory-mapped traces.
    pub fn path(&self) -> Option<&Path> {
        match self {
            TraceArray::Memory(_) => None,
            TraceArray::Mapped(array) => Some(array.path()),
        }
    }

    pub fn to_owned(&self) -> ArrayD<f64> {
        self.view().to_owned()
    }
}

/// Allocates a buffer of `shape`, file-backed at `path` if one is given.
pub fn allocate(shape: &[usize], path: Option<PathBuf>) -> Result<Box<dyn ResizableArray>> {
    match path {
        Some(path) => Ok(Box::new(MemmapBuffer::create(path, shape)?)),
        None => Ok(Box::new(MemoryBuffer::new(shape))),
    }
}

/// Replaces every character outside `[A-Za-z0-9_]` with `_`.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

pub fn trace_file_name(key: &str, chain: usize) -> String {
    format!("trace_{}_{chain}.npa", sanitize_key(key))
}

pub fn stats_file_name(transition: &str, key: &str, chain: usize) -> String {
    format!(
        "stats_{}_{}_{chain}.npa",
        sanitize_key(transition),
        sanitize_key(key)
    )
}

fn check_row(shape: &[usize], index: usize, row: &ArrayViewD<'_, f64>) -> Result<()> {
    if index >= shape[0] {
        return Err(McmcError::InvalidConfig(format!(
            "row {index} out of bounds for buffer of {} rows",
            shape[0]
        )));
    }
    if row.shape() != &shape[1..] {
        return Err(McmcError::InvalidConfig(format!(
            "row of shape {:?} does not fit buffer of shape {:?}",
            row.shape(),
            shape
        )));
    }
    Ok(())
}

/// In-memory buffer.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    data: ArrayD<f64>,
}

impl MemoryBuffer {
    pub fn new(shape: &[usize]) -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }
}

impl ResizableArray for MemoryBuffer {
    fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    fn write_row(&mut self, index: usize, row: ArrayViewD<'_, f64>) -> Result<()> {
        check_row(self.data.shape(), index, &row)?;
        self.data.index_axis_mut(Axis(0), index).assign(&row);
        Ok(())
    }

    fn truncate(self: Box<Self>, n_rows: usize) -> Result<StoredArray> {
        let mut data = self.data;
        if n_rows < data.len_of(Axis(0)) {
            data.slice_axis_inplace(Axis(0), Slice::from(0..n_rows));
            data = data.as_standard_layout().into_owned();
        }
        Ok(StoredArray::InMemory(data))
    }

    fn discard(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn encode_header(shape: &[usize]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..8].copy_from_slice(MAGIC);
    header[8..16].copy_from_slice(&(shape.len() as u64).to_le_bytes());
    for (i, &dim) in shape.iter().enumerate() {
        let start = 16 + 8 * i;
        header[start..start + 8].copy_from_slice(&(dim as u64).to_le_bytes());
    }
    header
}

fn decode_header(path: &Path, bytes: &[u8]) -> Result<Vec<usize>> {
    let invalid = |reason: &str| McmcError::Persistence {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if bytes.len() < HEADER_LEN {
        return Err(invalid("file shorter than header"));
    }
    if &bytes[..8] != MAGIC {
        return Err(invalid("bad magic"));
    }
    let read_u64 = |start: usize| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[start..start + 8]);
        u64::from_le_bytes(buf)
    };
    let ndim = read_u64(8) as usize;
    if ndim == 0 || ndim > MAX_NDIM {
        return Err(invalid("unsupported number of dimensions"));
    }
    Ok((0..ndim).map(|i| read_u64(16 + 8 * i) as usize).collect())
}

fn data_len(shape: &[usize]) -> usize {
    shape.iter().product::<usize>() * F64_SIZE
}

/// File-backed buffer writing rows straight into a writable memory map.
#[derive(Debug)]
pub struct MemmapBuffer {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    shape: Vec<usize>,
    row_len: usize,
}

impl MemmapBuffer {
    /// Creates the file at `path`, sized for `shape`.
    ///
    /// Fails if the file already exists, so a finished array that may still
    /// be mapped elsewhere is never rewritten.
    pub fn create(path: PathBuf, shape: &[usize]) -> Result<Self> {
        if shape.is_empty() || shape.len() > MAX_NDIM {
            return Err(McmcError::Persistence {
                path,
                reason: format!("cannot persist array with {} dimensions", shape.len()),
            });
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(McmcError::Persistence {
                    path,
                    reason: "file already exists; use a fresh memmap directory".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        file.set_len((HEADER_LEN + data_len(shape)) as u64)?;
        // SAFETY: the file was just created exclusively by this buffer, which
        // holds the only handle writing to it until it is truncated.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[..HEADER_LEN].copy_from_slice(&encode_header(shape));
        Ok(Self {
            path,
            file,
            mmap,
            shape: shape.to_vec(),
            row_len: shape[1..].iter().product(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data_mut(&mut self) -> Result<&mut [f64]> {
        // SAFETY: every bit pattern is a valid f64; alignment is checked below.
        let (prefix, data, _) = unsafe { self.mmap[HEADER_LEN..].align_to_mut::<f64>() };
        if !prefix.is_empty() {
            return Err(McmcError::Persistence {
                path: self.path.clone(),
                reason: "memory map is not aligned for f64".to_string(),
            });
        }
        Ok(data)
    }
}

impl ResizableArray for MemmapBuffer {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn write_row(&mut self, index: usize, row: ArrayViewD<'_, f64>) -> Result<()> {
        check_row(&self.shape, index, &row)?;
        let row_len = self.row_len;
        let data = self.data_mut()?;
        let dest = &mut data[index * row_len..(index + 1) * row_len];
        for (d, &x) in dest.iter_mut().zip(row.iter()) {
            *d = x;
        }
        Ok(())
    }

    fn truncate(self: Box<Self>, n_rows: usize) -> Result<StoredArray> {
        let MemmapBuffer {
            path,
            file,
            mut mmap,
            mut shape,
            ..
        } = *self;
        shape[0] = n_rows.min(shape[0]);
        mmap[..HEADER_LEN].copy_from_slice(&encode_header(&shape));
        mmap.flush()?;
        drop(mmap);
        file.set_len((HEADER_LEN + data_len(&shape)) as u64)?;
        file.sync_all()?;
        Ok(StoredArray::OnDisk(path))
    }

    fn discard(self: Box<Self>) -> Result<()> {
        let MemmapBuffer {
            path, file, mmap, ..
        } = *self;
        drop(mmap);
        drop(file);
        fs::remove_file(path)?;
        Ok(())
    }
}

/// A finished array mapped read-only from disk.
#[derive(Debug)]
pub struct PersistedArray {
    path: PathBuf,
    mmap: Mmap,
    shape: Vec<usize>,
}

impl PersistedArray {
    /// Maps the file at `path` and validates its header and length.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        // SAFETY: files written by `MemmapBuffer` are created exclusively and
        // never opened for writing again once truncated. Modifying them from
        // outside the crate while mapped is undefined behaviour.
        let mmap = unsafe { Mmap::map(&file)? };
        let shape = decode_header(&path, &mmap)?;
        if mmap.len() != HEADER_LEN + data_len(&shape) {
            return Err(McmcError::Persistence {
                path,
                reason: format!(
                    "file holds {} bytes but header describes shape {:?}",
                    mmap.len(),
                    shape
                ),
            });
        }
        // SAFETY: only the alignment is inspected here.
        let (prefix, _, _) = unsafe { mmap[HEADER_LEN..].align_to::<f64>() };
        if !prefix.is_empty() {
            return Err(McmcError::Persistence {
                path,
                reason: "memory map is not aligned for f64".to_string(),
            });
        }
        Ok(Self { path, mmap, shape })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn view(&self) -> ArrayViewD<'_, f64> {
        // SAFETY: alignment and length were validated in `open`.
        let (_, data, _) = unsafe { self.mmap[HEADER_LEN..].align_to::<f64>() };
        ArrayViewD::from_shape(IxDyn(&self.shape), data)
            .expect("Expecting persisted data to match the validated header shape")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr0, arr1, Array2};
    use tempfile::tempdir;

    fn fill(buffer: &mut dyn ResizableArray, rows: usize) {
        for i in 0..rows {
            let row = arr1(&[i as f64, -(i as f64)]).into_dyn();
            buffer.write_row(i, row.view()).unwrap();
        }
    }

    #[test]
    fn test_memory_buffer_truncates_rows() {
        let mut buffer: Box<dyn ResizableArray> = Box::new(MemoryBuffer::new(&[5, 2]));
        fill(buffer.as_mut(), 3);
        let trace = buffer.truncate(3).unwrap().load().unwrap();
        assert_eq!(trace.shape(), &[3, 2]);
        assert_eq!(trace.view()[[2, 1]], -2.0);
        assert!(trace.path().is_none());
    }

    #[test]
    fn test_memmap_buffer_roundtrip_after_truncation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(trace_file_name("pos", 0));
        let mut buffer = allocate(&[10, 2], Some(path.clone())).unwrap();
        fill(buffer.as_mut(), 4);
        let stored = buffer.truncate(4).unwrap();
        assert_eq!(stored, StoredArray::OnDisk(path.clone()));

        let metadata = fs::metadata(&path).unwrap();
        assert_eq!(metadata.len() as usize, HEADER_LEN + 4 * 2 * 8);

        let trace = stored.load().unwrap();
        let expected = Array2::from_shape_fn((4, 2), |(i, j)| {
            if j == 0 {
                i as f64
            } else {
                -(i as f64)
            }
        });
        assert_eq!(trace.view(), expected.into_dyn().view());
        assert_eq!(trace.path(), Some(path.as_path()));
    }

    #[test]
    fn test_memmap_scalar_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(stats_file_name("integration", "accept_stat", 1));
        let mut buffer = allocate(&[3], Some(path.clone())).unwrap();
        for i in 0..3 {
            buffer
                .write_row(i, arr0(0.25 * i as f64).into_dyn().view())
                .unwrap();
        }
        let trace = buffer.truncate(3).unwrap().load().unwrap();
        assert_eq!(trace.to_owned(), arr1(&[0.0, 0.25, 0.5]).into_dyn());
    }

    #[test]
    fn test_existing_file_is_never_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(trace_file_name("pos", 0));
        let mut buffer = allocate(&[2, 2], Some(path.clone())).unwrap();
        fill(buffer.as_mut(), 2);
        let first = buffer.truncate(2).unwrap().load().unwrap();
        let before = first.to_owned();

        let err = allocate(&[5, 2], Some(path.clone())).err().unwrap();
        assert!(matches!(err, McmcError::Persistence { .. }));
        assert_eq!(first.to_owned(), before);
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, HEADER_LEN + 2 * 2 * 8);
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trace_pos_3.npa");
        let buffer = allocate(&[2, 2], Some(path.clone())).unwrap();
        assert!(path.exists());
        buffer.discard().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_write_row_rejects_bad_shape() {
        let mut buffer = MemoryBuffer::new(&[2, 3]);
        let row = arr1(&[1.0, 2.0]).into_dyn();
        assert!(buffer.write_row(0, row.view()).is_err());
        let row = arr1(&[1.0, 2.0, 3.0]).into_dyn();
        assert!(buffer.write_row(2, row.view()).is_err());
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.npa");
        fs::write(&path, vec![0u8; 80]).unwrap();
        let err = PersistedArray::open(&path).unwrap_err();
        assert!(matches!(err, McmcError::Persistence { .. }));
    }

    #[test]
    fn test_file_names_are_sanitized() {
        assert_eq!(trace_file_name("pos", 2), "trace_pos_2.npa");
        assert_eq!(
            stats_file_name("integration transition", "accept/stat", 0),
            "stats_integration_transition_accept_stat_0.npa"
        );
    }
}
