//! Byte-counting and digest stream adapters.
//!
//! The codec threads its I/O through two thin wrappers: a counting adapter
//! that tracks the absolute position inside the decompressed payload (the
//! coordinate space references are expressed in) and a SHA-256 adapter that
//! folds every byte it sees into the container digest. Both wrap the
//! post-gzip view of the stream.

use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Reads exactly `buf.len()` bytes, mapping a clean EOF to
/// [`Error::TruncatedStream`] with the given context.
pub(crate) fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    context: &str,
) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::TruncatedStream(context.to_owned())
        } else {
            Error::io(e, context)
        }
    })
}

/// Reads a big-endian `u16`.
///
/// # Errors
/// Returns [`Error::TruncatedStream`] if the stream ends first.
pub(crate) fn read_u16_be<R: Read>(reader: &mut R, context: &str) -> Result<u16> {
    let mut buf = [0; 2];
    read_exact_or_truncated(reader, &mut buf, context)?;
    Ok(u16::from_be_bytes(buf))
}

/// A writer adapter that counts the bytes passed through it.
pub(crate) struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// The number of bytes written since construction.
    pub(crate) fn position(&self) -> u64 {
        self.written
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A reader adapter that counts the bytes passed through it.
pub(crate) struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> CountingReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }

    /// The number of bytes consumed since construction.
    pub(crate) fn position(&self) -> u64 {
        self.consumed
    }

    pub(crate) fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let consumed = self.inner.read(buf)?;
        self.consumed += consumed as u64;
        Ok(consumed)
    }
}

/// A writer adapter that updates a SHA-256 digest with every byte written.
pub(crate) struct DigestWriter<W> {
    inner: W,
    digest: Sha256,
}

impl<W: Write> DigestWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            digest: Sha256::new(),
        }
    }

    /// Finishes the digest, returning it along with the wrapped writer so the
    /// caller can append the digest bytes outside the coverage window.
    pub(crate) fn finalize(self) -> ([u8; 32], W) {
        (self.digest.finalize().into(), self.inner)
    }

    pub(crate) fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digest.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A reader adapter that updates a SHA-256 digest with every byte read.
pub(crate) struct DigestReader<R> {
    inner: R,
    digest: Sha256,
}

impl<R: Read> DigestReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            digest: Sha256::new(),
        }
    }

    /// Finishes the digest, returning it along with the wrapped reader so the
    /// caller can read the trailing digest bytes outside the coverage window.
    pub(crate) fn finalize(self) -> ([u8; 32], R) {
        (self.digest.finalize().into(), self.inner)
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let consumed = self.inner.read(buf)?;
        self.digest.update(&buf[..consumed]);
        Ok(consumed)
    }
}
