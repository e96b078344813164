//! Pseudorandom upload payloads.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::GENERATION_CHUNK_SIZE;

/// Prefix of temporary payload files.
pub const TEMP_FILE_PREFIX: &str = "speedprobe-";

/// Suffix of temporary payload files.
pub const TEMP_FILE_SUFFIX: &str = ".upload";

/// Produces pseudorandom byte sequences, in memory or on disk.
///
/// Each engine owns one generator; there is no process-wide random state.
pub struct PayloadGenerator {
    rng: StdRng,
}

impl Default for PayloadGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadGenerator {
    /// Creates a generator seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Creates a deterministic generator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Derives an independent generator, advancing this one.
    pub fn fork(&mut self) -> Self {
        Self::seeded(self.rng.next_u64())
    }

    /// Returns exactly `len` random bytes.
    pub fn generate(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for chunk in out.chunks_mut(GENERATION_CHUNK_SIZE) {
            self.rng.fill_bytes(chunk);
        }
        out
    }

    /// Writes exactly `len` random bytes to a new temporary file.
    ///
    /// The file outlives the returned handle until [`PayloadFile::delete`]
    /// is called.
    pub fn generate_to_temp_file(&mut self, len: u64) -> io::Result<PayloadFile> {
        let (mut file, path) = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .suffix(TEMP_FILE_SUFFIX)
            .tempfile()?
            .keep()
            .map_err(|e| e.error)?;

        if let Err(e) = self.fill_file(&mut file, len) {
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        debug!(path = %path.display(), size = len, "payload file written");
        Ok(PayloadFile { path, len })
    }

    fn fill_file(&mut self, file: &mut fs::File, len: u64) -> io::Result<()> {
        let mut buf = vec![0u8; GENERATION_CHUNK_SIZE.min(len as usize)];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.rng.fill_bytes(&mut buf[..n]);
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.flush()
    }
}

/// A payload persisted in the temp directory.
#[derive(Debug)]
pub struct PayloadFile {
    path: PathBuf,
    len: u64,
}

impl PayloadFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Removes the backing file.
    pub fn delete(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Upload body, either held in memory or streamed from a file.
#[derive(Debug)]
pub enum Payload {
    Memory(Vec<u8>),
    File(PayloadFile),
}

impl Payload {
    pub fn len(&self) -> u64 {
        match self {
            Self::Memory(data) => data.len() as u64,
            Self::File(file) => file.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops the payload, deleting its backing file if it has one.
    pub fn release(self) {
        if let Self::File(file) = self {
            let path = file.path().to_path_buf();
            if let Err(e) = file.delete() {
                warn!(path = %path.display(), error = %e, "failed to delete payload file");
            }
        }
    }

    pub(crate) async fn open(&self) -> io::Result<PayloadReader<'_>> {
        Ok(match self {
            Self::Memory(data) => PayloadReader::Memory { data, pos: 0 },
            Self::File(file) => PayloadReader::File(tokio::fs::File::open(file.path()).await?),
        })
    }
}

/// Sequential chunk source over a [`Payload`].
pub(crate) enum PayloadReader<'a> {
    Memory { data: &'a [u8], pos: usize },
    File(tokio::fs::File),
}

impl<'a> PayloadReader<'a> {
    /// Returns the next `len` bytes, using `buf` as scratch space when the
    /// payload lives on disk.
    pub(crate) async fn next_chunk<'b>(
        &'b mut self,
        buf: &'b mut [u8],
        len: usize,
    ) -> io::Result<&'b [u8]>
    where
        'a: 'b,
    {
        match self {
            Self::Memory { data, pos } => {
                let end = pos.saturating_add(len);
                let chunk = data
                    .get(*pos..end)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
                *pos = end;
                Ok(chunk)
            }
            Self::File(file) => {
                let chunk = buf
                    .get_mut(..len)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
                file.read_exact(chunk).await?;
                Ok(chunk)
            }
        }
    }
}
