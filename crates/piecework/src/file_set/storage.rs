//! Where the bytes of a torrent end up.
use std::{
    fmt::Debug,
    fs::{create_dir_all, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::debug;

/// Byte-addressed access to the data of a torrent, offsets are relative to
/// the start of the first file.
///
/// Calls are blocking, the disk queue runs them on the blocking pool.
pub trait Storage: Send + Sync + Debug {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Drop the data of a range that turned out to be corrupted.
    fn discard(&self, _offset: u64, _len: usize) -> io::Result<()> {
        Ok(())
    }
}

/// A file of the torrent, the offset is the accumulated length of all the
/// files that come before it.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageFile {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Storage backed by the files of the torrent on the filesystem.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    files: Vec<StorageFile>,
}

impl FileStorage {
    /// `files` are `(path relative to root, length)` in torrent order.
    pub fn new(
        root: impl Into<PathBuf>,
        files: impl IntoIterator<Item = (PathBuf, u64)>,
    ) -> Self {
        let mut offset = 0;
        let files = files
            .into_iter()
            .map(|(path, length)| {
                let file = StorageFile { path, offset, length };
                offset += length;
                file
            })
            .collect();

        Self { root: root.into(), files }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[StorageFile] {
        &self.files
    }

    /// Open a file for reading and writing, creating it and its directories
    /// if they don't exist.
    pub fn open_file(path: impl AsRef<Path>) -> io::Result<File> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)
    }

    /// The slices of the files touched by `[offset, offset + len)`,
    /// as `(file, offset inside the file, range inside the buffer)`.
    fn spans(
        &self,
        offset: u64,
        len: usize,
    ) -> io::Result<Vec<(&StorageFile, u64, std::ops::Range<usize>)>> {
        let end = offset + len as u64;
        let mut spans = Vec::new();

        for file in &self.files {
            let file_end = file.offset + file.length;
            if file_end <= offset || file.offset >= end || file.length == 0 {
                continue;
            }
            let start = offset.max(file.offset);
            let stop = end.min(file_end);
            let buf_start = (start - offset) as usize;
            let buf_end = (stop - offset) as usize;

            spans.push((file, start - file.offset, buf_start..buf_end));
        }

        let covered: usize = spans.iter().map(|(_, _, r)| r.len()).sum();
        if covered != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset exceeds file sizes",
            ));
        }

        Ok(spans)
    }
}

impl Storage for FileStorage {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        for (file, file_offset, range) in self.spans(offset, data.len())? {
            let path = self.root.join(&file.path);
            debug!("writing {} bytes to {path:?} at {file_offset}", range.len());

            let mut f = Self::open_file(&path)?;
            f.seek(SeekFrom::Start(file_offset))?;
            f.write_all(&data[range])?;
        }
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];

        for (file, file_offset, range) in self.spans(offset, len)? {
            let mut f = File::open(self.root.join(&file.path))?;
            f.seek(SeekFrom::Start(file_offset))?;
            f.read_exact(&mut buf[range])?;
        }

        Ok(buf)
    }

    /// Zero the range, so a corrupted piece is never read back as data.
    fn discard(&self, offset: u64, len: usize) -> io::Result<()> {
        self.write_at(offset, &vec![0; len])
    }
}

/// Storage that keeps the whole torrent in memory.
#[derive(Debug)]
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new(size: usize) -> Self {
        Self { data: Mutex::new(vec![0; size]) }
    }
}

impl Storage for MemoryStorage {
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut buf = self.data.lock();
        let start = offset as usize;
        let dst = buf.get_mut(start..start + data.len()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Offset exceeds size")
        })?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let buf = self.data.lock();
        let start = offset as usize;
        buf.get(start..start + len).map(|v| v.to_vec()).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "Offset exceeds size")
        })
    }

    fn discard(&self, offset: u64, len: usize) -> io::Result<()> {
        let mut buf = self.data.lock();
        let start = offset as usize;
        if let Some(dst) = buf.get_mut(start..start + len) {
            dst.fill(0);
        }
        Ok(())
    }
}
