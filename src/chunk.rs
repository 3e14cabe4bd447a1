//! Plain length-prefixed chunk framing (ChunkStream with security "none"),
//! plus the per-direction codec dispatch shared by both connection ends.

use std::io;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::aead::{AeadCipher, AeadReader, AeadWriter};
use crate::pool;
use crate::protocol::{Security, OPT_CHUNK_MASKING, OPT_CHUNK_STREAM, OPT_GLOBAL_PADDING};
use crate::shake::ShakeSizeParser;

pub const LEN_SIZE: usize = 2;
pub const CHUNK_SIZE: usize = 1 << 14;
/// Upper bound on a frame's declared size when lengths are sent in the
/// clear; masked sizes are bounded by the 16-bit domain instead.
pub const MAX_SIZE: usize = 17 * 1024;

/* ========================= Reader ========================= */

pub struct ChunkReader<R> {
    inner: R,
    shake: Option<ShakeSizeParser>,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
}

impl<R> Drop for ChunkReader<R> {
    fn drop(&mut self) {
        pool::put_buffer(std::mem::take(&mut self.buf));
    }
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(inner: R, shake: Option<ShakeSizeParser>) -> Self {
        ChunkReader {
            inner,
            shake,
            buf: pool::get_buffer(),
            start: 0,
            end: 0,
            eof: false,
        }
    }

    pub async fn read(&mut self, b: &mut [u8]) -> io::Result<usize> {
        if self.start < self.end {
            let n = (self.end - self.start).min(b.len());
            b[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
            self.start += n;
            return Ok(n);
        }
        if self.eof || b.is_empty() {
            return Ok(0);
        }

        let mut size_buf = [0u8; LEN_SIZE];
        self.inner.read_exact(&mut size_buf).await?;

        let (size, padding) = match self.shake.as_mut() {
            Some(p) => {
                let padding = p.next_padding_len() as usize;
                let total = p.decode_size(size_buf) as usize;
                let size = total.checked_sub(padding).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        "masked chunk shorter than its padding",
                    )
                })?;
                (size, padding)
            }
            None => (u16::from_be_bytes(size_buf) as usize, 0),
        };

        if self.shake.is_none() && size > MAX_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk length exceeds limit",
            ));
        }
        if size == 0 {
            // zero-length terminator: drain its padding so the connection
            // closes with nothing left unread
            if padding > 0 {
                self.inner.read_exact(&mut self.buf[..padding]).await?;
            }
            self.eof = true;
            return Ok(0);
        }

        let total = size + padding;
        if total > self.buf.len() {
            self.buf.resize(total, 0);
        }
        self.inner.read_exact(&mut self.buf[..total]).await?;

        let n = size.min(b.len());
        b[..n].copy_from_slice(&self.buf[..n]);
        self.start = n;
        self.end = size;
        Ok(n)
    }
}

/* ========================= Writer ========================= */

pub struct ChunkWriter<W> {
    inner: W,
    shake: Option<ShakeSizeParser>,
    buf: Vec<u8>,
}

impl<W> Drop for ChunkWriter<W> {
    fn drop(&mut self) {
        pool::put_buffer(std::mem::take(&mut self.buf));
    }
}

impl<W: AsyncWrite + Unpin> ChunkWriter<W> {
    pub fn new(inner: W, shake: Option<ShakeSizeParser>) -> Self {
        ChunkWriter {
            inner,
            shake,
            buf: pool::get_buffer(),
        }
    }

    pub async fn write(&mut self, b: &[u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < b.len() {
            let padding = self.shake.as_mut().map_or(0, |p| p.next_padding_len() as usize);
            let read_len = (b.len() - n).min(CHUNK_SIZE - padding);
            let total = read_len + padding;

            let prefix = match self.shake.as_mut() {
                Some(p) => p.encode_size(total as u16),
                None => (total as u16).to_be_bytes(),
            };
            self.buf[..LEN_SIZE].copy_from_slice(&prefix);
            self.buf[LEN_SIZE..LEN_SIZE + read_len].copy_from_slice(&b[n..n + read_len]);
            if padding > 0 {
                rand::thread_rng()
                    .fill_bytes(&mut self.buf[LEN_SIZE + read_len..LEN_SIZE + total]);
            }

            self.inner.write_all(&self.buf[..LEN_SIZE + total]).await?;
            n += read_len;
        }
        self.inner.flush().await?;
        Ok(n)
    }

    /// Emit the zero-length terminator frame and shut the underlying writer down.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        let padding = self.shake.as_mut().map_or(0, |p| p.next_padding_len() as usize);
        let prefix = match self.shake.as_mut() {
            Some(p) => p.encode_size(padding as u16),
            None => 0u16.to_be_bytes(),
        };
        self.buf[..LEN_SIZE].copy_from_slice(&prefix);
        if padding > 0 {
            rand::thread_rng().fill_bytes(&mut self.buf[LEN_SIZE..LEN_SIZE + padding]);
        }
        self.inner.write_all(&self.buf[..LEN_SIZE + padding]).await?;
        self.inner.flush().await?;
        self.inner.shutdown().await
    }
}

/* ========================= Codec dispatch ========================= */

fn shake_parser(opt: u8, iv: &[u8; 16]) -> Option<ShakeSizeParser> {
    if opt & OPT_CHUNK_MASKING != 0 {
        Some(ShakeSizeParser::new(iv, opt & OPT_GLOBAL_PADDING != 0))
    } else {
        None
    }
}

/// One direction of a connection's data stream, selected from the negotiated
/// options and keyed/seeded with that direction's body key and IV.
pub enum DataReader<R> {
    Raw(R),
    Chunked(ChunkReader<R>),
    Aead(AeadReader<R>),
}

impl<R: AsyncRead + Unpin> DataReader<R> {
    pub fn new(inner: R, security: Security, opt: u8, key: &[u8; 16], iv: &[u8; 16]) -> Self {
        if opt & OPT_CHUNK_STREAM == 0 {
            return DataReader::Raw(inner);
        }
        let shake = shake_parser(opt, iv);
        match security {
            Security::None => DataReader::Chunked(ChunkReader::new(inner, shake)),
            Security::Aes128Gcm => {
                DataReader::Aead(AeadReader::new(inner, AeadCipher::aes_128_gcm(key), *iv, shake))
            }
            Security::Chacha20Poly1305 => DataReader::Aead(AeadReader::new(
                inner,
                AeadCipher::chacha20_poly1305(key),
                *iv,
                shake,
            )),
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DataReader::Raw(r) => r.read(buf).await,
            DataReader::Chunked(r) => r.read(buf).await,
            DataReader::Aead(r) => r.read(buf).await,
        }
    }
}

pub enum DataWriter<W> {
    Raw(W),
    Chunked(ChunkWriter<W>),
    Aead(AeadWriter<W>),
}

impl<W: AsyncWrite + Unpin> DataWriter<W> {
    pub fn new(inner: W, security: Security, opt: u8, key: &[u8; 16], iv: &[u8; 16]) -> Self {
        if opt & OPT_CHUNK_STREAM == 0 {
            return DataWriter::Raw(inner);
        }
        let shake = shake_parser(opt, iv);
        match security {
            Security::None => DataWriter::Chunked(ChunkWriter::new(inner, shake)),
            Security::Aes128Gcm => {
                DataWriter::Aead(AeadWriter::new(inner, AeadCipher::aes_128_gcm(key), *iv, shake))
            }
            Security::Chacha20Poly1305 => DataWriter::Aead(AeadWriter::new(
                inner,
                AeadCipher::chacha20_poly1305(key),
                *iv,
                shake,
            )),
        }
    }

    pub async fn write(&mut self, b: &[u8]) -> io::Result<usize> {
        match self {
            DataWriter::Raw(w) => {
                w.write_all(b).await?;
                Ok(b.len())
            }
            DataWriter::Chunked(w) => w.write(b).await,
            DataWriter::Aead(w) => w.write(b).await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            DataWriter::Raw(w) => w.shutdown().await,
            DataWriter::Chunked(w) => w.shutdown().await,
            DataWriter::Aead(w) => w.shutdown().await,
        }
    }
}
