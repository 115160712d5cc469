//! Streaming file writer for raw-data recording.
//!
//! The buffered recording path copies element payloads through this writer:
//! a large in-memory buffer in front of the output file, optionally lz4
//! frame compression, optionally `O_DIRECT` block writes for recording onto
//! fast local storage without polluting the page cache. Write failures are
//! reported through the return value so the recording loop can count them
//! without aborting.

use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use lz4_flex::frame::FrameEncoder;
use tracing::{debug, warn};

use crate::config::CompressionAlgorithm;
use crate::error::{ReadoutError, Result};

/// Block size accepted by `O_DIRECT` on common filesystems (XFS default).
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// A heap block aligned for direct I/O.
struct AlignedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    len: usize,
}

impl AlignedBlock {
    fn new(capacity: usize) -> Option<Self> {
        let layout = Layout::from_size_align(capacity, DIRECT_IO_ALIGNMENT).ok()?;
        // SAFETY: capacity > 0 is checked by the caller.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        Some(Self {
            ptr,
            layout,
            capacity,
            len: 0,
        })
    }

    /// Appends as much of `bytes` as fits; returns the number consumed.
    fn push(&mut self, bytes: &[u8]) -> usize {
        let space = self.capacity - self.len;
        let taking = space.min(bytes.len());
        // SAFETY: destination range stays within the allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                taking,
            );
        }
        self.len += taking;
        taking
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the first `len` bytes are initialized by `push`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the stored layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the block is an owned allocation.
unsafe impl Send for AlignedBlock {}

enum Backend {
    Plain(BufWriter<File>),
    Lz4(Box<FrameEncoder<BufWriter<File>>>),
    Direct { file: File, block: AlignedBlock },
}

/// Buffered writer for recording streams.
pub struct BufferedFileWriter {
    path: PathBuf,
    backend: Option<Backend>,
    bytes_written: u64,
}

impl BufferedFileWriter {
    /// Opens (and truncates) `path` with an in-memory buffer of
    /// `buffer_size` bytes.
    ///
    /// `use_o_direct` switches to aligned whole-block writes; it is ignored
    /// with a warning when combined with compression, and requires
    /// `buffer_size` to be a 4096-multiple.
    pub fn open(
        path: &Path,
        buffer_size: usize,
        compression: CompressionAlgorithm,
        use_o_direct: bool,
    ) -> Result<Self> {
        let direct = use_o_direct && compression == CompressionAlgorithm::None;
        if use_o_direct && !direct {
            warn!(path = %path.display(), "O_DIRECT ignored for compressed recording");
        }
        if direct && (buffer_size == 0 || buffer_size % DIRECT_IO_ALIGNMENT != 0) {
            return Err(ReadoutError::Initialization {
                message: format!(
                    "streaming buffer size {buffer_size} is not divisible by {DIRECT_IO_ALIGNMENT}"
                ),
            });
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(path).map_err(|source| ReadoutError::CannotOpenFile {
            path: path.to_owned(),
            source,
        })?;

        let backend = if direct {
            let block = AlignedBlock::new(buffer_size).ok_or_else(|| {
                ReadoutError::Initialization {
                    message: "cannot allocate aligned streaming buffer".into(),
                }
            })?;
            Backend::Direct { file, block }
        } else {
            let buffered = BufWriter::with_capacity(buffer_size.max(4096), file);
            match compression {
                CompressionAlgorithm::None => Backend::Plain(buffered),
                CompressionAlgorithm::Lz4 => Backend::Lz4(Box::new(FrameEncoder::new(buffered))),
            }
        };
        debug!(path = %path.display(), buffer_size, ?compression, direct, "opened recording file");
        Ok(Self {
            path: path.to_owned(),
            backend: Some(backend),
            bytes_written: 0,
        })
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes `bytes`, buffered. Returns `false` on an I/O failure; the
    /// caller counts failures and carries on.
    pub fn write(&mut self, mut bytes: &[u8]) -> bool {
        let total = bytes.len() as u64;
        let ok = match self.backend.as_mut() {
            None => false,
            Some(Backend::Plain(writer)) => writer.write_all(bytes).is_ok(),
            Some(Backend::Lz4(encoder)) => encoder.write_all(bytes).is_ok(),
            Some(Backend::Direct { file, block }) => loop {
                let taken = block.push(bytes);
                bytes = &bytes[taken..];
                if block.is_full() {
                    if file.write_all(block.as_slice()).is_err() {
                        break false;
                    }
                    block.clear();
                }
                if bytes.is_empty() {
                    break true;
                }
            },
        };
        if ok {
            self.bytes_written += total;
        }
        ok
    }

    /// Flushes buffered bytes to the file. For direct I/O the trailing
    /// partial block is written with `O_DIRECT` temporarily lifted.
    pub fn flush(&mut self) -> bool {
        match self.backend.as_mut() {
            None => false,
            Some(Backend::Plain(writer)) => writer.flush().is_ok(),
            Some(Backend::Lz4(encoder)) => encoder.flush().is_ok(),
            Some(Backend::Direct { file, block }) => {
                if block.len == 0 {
                    return true;
                }
                let fd = file.as_raw_fd();
                // SAFETY: plain fcntl flag toggles on an owned fd.
                let previous = unsafe { libc::fcntl(fd, libc::F_GETFL) };
                unsafe { libc::fcntl(fd, libc::F_SETFL, previous & !libc::O_DIRECT) };
                let ok = file.write_all(block.as_slice()).is_ok();
                unsafe { libc::fcntl(fd, libc::F_SETFL, previous) };
                block.clear();
                ok
            }
        }
    }

    /// Flushes and closes the file.
    pub fn close(&mut self) -> Result<()> {
        if !self.flush() {
            warn!(path = %self.path.display(), "flush on close failed");
        }
        match self.backend.take() {
            Some(Backend::Lz4(encoder)) => {
                encoder
                    .finish()
                    .map_err(|_| ReadoutError::CannotWriteToFile {
                        path: self.path.clone(),
                    })?
                    .flush()
                    .map_err(|_| ReadoutError::CannotWriteToFile {
                        path: self.path.clone(),
                    })?;
            }
            Some(_) | None => {}
        }
        Ok(())
    }
}

impl Drop for BufferedFileWriter {
    fn drop(&mut self) {
        if self.backend.is_some() {
            let _ = self.close();
        }
    }
}
