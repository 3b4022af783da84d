//! Repeating-key XOR cipher used by the encryption delegate.
//!
//! Encryption and decryption are the same operation. The keystream position
//! is a running byte offset, so a file processed in several chunks gives the
//! same result as one processed in a single buffer.

use std::io::{self, Read, Write};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct XorCipher {
    key: Vec<u8>,
    offset: u64,
}

impl XorCipher {
    /// Returns `None` for an empty key.
    pub fn new(key: &[u8]) -> Option<Self> {
        if key.is_empty() {
            return None;
        }
        Some(Self {
            key: key.to_vec(),
            offset: 0,
        })
    }

    /// Bytes processed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        let len = self.key.len() as u64;
        for byte in buf.iter_mut() {
            *byte ^= self.key[(self.offset % len) as usize];
            self.offset += 1;
        }
    }
}

/// Stream `reader` through the cipher into `writer`, returning the byte count.
pub fn transform<R: Read, W: Write>(reader: &mut R, writer: &mut W, key: &[u8]) -> io::Result<u64> {
    let mut cipher = XorCipher::new(key)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "encryption key is empty"))?;
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        cipher.apply(&mut buffer[..n]);
        writer.write_all(&buffer[..n])?;
    }

    writer.flush()?;
    Ok(cipher.offset())
}
