use std::io::{self, Read, Write};

use sha2::{Digest, Sha256};

use crate::{COPY_BUFFER_SIZE, TransferInfo};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `Read` adapter that counts and hashes every byte read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Reads and discards everything left in the stream.
    pub fn drain(&mut self) -> io::Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut drained = 0u64;
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(drained);
            }
            drained += n as u64;
        }
    }

    pub fn finish(self) -> TransferInfo {
        TransferInfo {
            num_bytes: self.count,
            checksum: hex::encode(self.hasher.finalize()),
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// `Write` adapter that counts and hashes every byte accepted by the inner
/// writer.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    count: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    pub fn finish(self) -> TransferInfo {
        TransferInfo {
            num_bytes: self.count,
            checksum: hex::encode(self.hasher.finalize()),
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
