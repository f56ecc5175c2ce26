//! Payload producers for the transmission loop.
//!
//! Every chunk is `size` content bytes followed by a single `0` terminator, so
//! a chunk buffer is always `size + 1` bytes long. The transmission engine
//! treats chunks as text and sends up to the first terminator (see
//! [`payload_len`]).

use crate::config::SourceKind;
use crate::Result;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Chunk terminator byte.
pub const TERMINATOR: u8 = 0;

/// Lowest byte value produced by [`RandomSource`] (`'!'`).
pub const RANDOM_MIN: u8 = 33;

/// Highest byte value produced by [`RandomSource`] (`'}'`).
pub const RANDOM_MAX: u8 = 125;

/// Producer of fixed-size data chunks.
pub trait DataSource: Send {
    /// Fills `buf` with one chunk: exactly `size + 1` bytes, the last one being
    /// [`TERMINATOR`]. Failures are logged and never abort the caller.
    fn fill(&mut self, buf: &mut Vec<u8>, size: usize);

    /// Releases whatever the source holds open.
    fn close(&mut self) {}
}

/// Number of bytes of `chunk` to put on the wire: the distance to the first
/// terminator, capped at `size`.
///
/// # Examples
///
/// ```
/// use protoprobe::source::payload_len;
///
/// assert_eq!(payload_len(b"abcd\0", 4), 4);
/// assert_eq!(payload_len(b"ab\0d\0", 4), 2);
/// ```
pub fn payload_len(chunk: &[u8], size: usize) -> usize {
    let limit = size.min(chunk.len());
    chunk[..limit]
        .iter()
        .position(|&b| b == TERMINATOR)
        .unwrap_or(limit)
}

/// Opens the source described by `kind`.
///
/// # Errors
///
/// Returns an error if a file source cannot be opened.
pub fn open_source(kind: &SourceKind) -> Result<Box<dyn DataSource>> {
    match kind {
        SourceKind::Random => Ok(Box::new(RandomSource::new())),
        SourceKind::File(path) => Ok(Box::new(FileSource::open(path)?)),
    }
}

/// Reads consecutive chunks from a file.
///
/// A short read (including end of file) leaves the unread tail zeroed, so the
/// chunk's text length is the number of bytes actually read.
pub struct FileSource {
    file: Option<File>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        debug!("Reading packet data from {}", path.as_ref().display());
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self { file: Some(file) }
    }

    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Reading packet data failed: {}", e);
                    break;
                }
            }
        }
        filled
    }
}

impl DataSource for FileSource {
    fn fill(&mut self, buf: &mut Vec<u8>, size: usize) {
        buf.clear();
        buf.resize(size + 1, TERMINATOR);

        let read = self.read_into(&mut buf[..size]);
        if read < size {
            warn!("Short read from packet file: {} of {} bytes", read, size);
        }
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// Generates printable pseudo-random payloads.
///
/// The generator is reseeded from OS entropy on every call. Not for
/// cryptographic use.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSource;

impl RandomSource {
    pub fn new() -> Self {
        Self
    }
}

impl DataSource for RandomSource {
    fn fill(&mut self, buf: &mut Vec<u8>, size: usize) {
        let mut rng = StdRng::from_entropy();
        buf.clear();
        buf.extend((0..size).map(|_| rng.gen_range(RANDOM_MIN..=RANDOM_MAX)));
        buf.push(TERMINATOR);
    }
}
