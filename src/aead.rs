//! AEAD-framed chunk streams (AES-128-GCM and ChaCha20-Poly1305).
//!
//! Each frame is `[length prefix][ciphertext][tag][random padding]`. The
//! nonce is the per-direction frame counter (big-endian u16) followed by
//! bytes 2..12 of the direction's body IV. A tag-only frame (payload length
//! equal to the AEAD overhead) terminates the stream.

use std::io;

use aes_gcm::aead::AeadMutInPlace;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunk::{CHUNK_SIZE, LEN_SIZE, MAX_SIZE};
use crate::crypto;
use crate::pool;
use crate::shake::ShakeSizeParser;

pub const TAG_SIZE: usize = 16;

/// Build a 12-byte AEAD nonce: `[counter_u16_be(2)] || iv[2..12]`.
pub fn make_nonce(count: u16, iv: &[u8; 16]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0..2].copy_from_slice(&count.to_be_bytes());
    nonce[2..12].copy_from_slice(&iv[2..12]);
    nonce
}

/* ========================= Cipher selection ========================= */

pub enum AeadCipher {
    Aes128Gcm(Box<Aes128Gcm>),
    Chacha20Poly1305(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    /// AES-128-GCM keyed directly with the 16-byte body key.
    pub fn aes_128_gcm(key: &[u8; 16]) -> Self {
        AeadCipher::Aes128Gcm(Box::new(Aes128Gcm::new(key.into())))
    }

    /// ChaCha20-Poly1305 keyed with `MD5(key) || MD5(MD5(key))`.
    pub fn chacha20_poly1305(key: &[u8; 16]) -> Self {
        let key = crypto::chacha20poly1305_key(key);
        AeadCipher::Chacha20Poly1305(Box::new(ChaCha20Poly1305::new(
            chacha20poly1305::Key::from_slice(&key),
        )))
    }

    fn seal_detached(&mut self, nonce: &[u8; 12], buf: &mut [u8]) -> io::Result<[u8; TAG_SIZE]> {
        let tag = match self {
            AeadCipher::Aes128Gcm(cipher) => cipher
                .encrypt_in_place_detached(Nonce::from_slice(nonce), &[], buf)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "chunk encryption failed"))?,
            AeadCipher::Chacha20Poly1305(cipher) => cipher
                .encrypt_in_place_detached(chacha20poly1305::Nonce::from_slice(nonce), &[], buf)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "chunk encryption failed"))?,
        };
        Ok(tag.into())
    }

    fn open_detached(&mut self, nonce: &[u8; 12], buf: &mut [u8], tag: &[u8]) -> io::Result<()> {
        match self {
            AeadCipher::Aes128Gcm(cipher) => cipher.decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &[],
                buf,
                aes_gcm::Tag::from_slice(tag),
            ),
            AeadCipher::Chacha20Poly1305(cipher) => cipher.decrypt_in_place_detached(
                chacha20poly1305::Nonce::from_slice(nonce),
                &[],
                buf,
                chacha20poly1305::Tag::from_slice(tag),
            ),
        }
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk authentication failed"))
    }
}

/* ========================= Writer ========================= */

pub struct AeadWriter<W> {
    inner: W,
    cipher: AeadCipher,
    iv: [u8; 16],
    count: u16,
    shake: Option<ShakeSizeParser>,
    buf: Vec<u8>,
}

impl<W> Drop for AeadWriter<W> {
    fn drop(&mut self) {
        pool::put_buffer(std::mem::take(&mut self.buf));
    }
}

impl<W: AsyncWrite + Unpin> AeadWriter<W> {
    pub fn new(inner: W, cipher: AeadCipher, iv: [u8; 16], shake: Option<ShakeSizeParser>) -> Self {
        AeadWriter {
            inner,
            cipher,
            iv,
            count: 0,
            shake,
            buf: pool::get_buffer(),
        }
    }

    pub async fn write(&mut self, b: &[u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < b.len() {
            // padding length must be drawn before the size, both ends agree
            let padding = self.shake.as_mut().map_or(0, |p| p.next_padding_len() as usize);
            let read_len = (b.len() - n).min(CHUNK_SIZE - TAG_SIZE - padding);
            let encrypted_size = read_len + TAG_SIZE;
            let total = LEN_SIZE + encrypted_size + padding;

            let size_word = (encrypted_size + padding) as u16;
            let prefix = match self.shake.as_mut() {
                Some(p) => p.encode_size(size_word),
                None => size_word.to_be_bytes(),
            };
            self.buf[..LEN_SIZE].copy_from_slice(&prefix);
            self.buf[LEN_SIZE..LEN_SIZE + read_len].copy_from_slice(&b[n..n + read_len]);

            let nonce = make_nonce(self.count, &self.iv);
            self.count = self.count.wrapping_add(1);
            let tag = self
                .cipher
                .seal_detached(&nonce, &mut self.buf[LEN_SIZE..LEN_SIZE + read_len])?;
            self.buf[LEN_SIZE + read_len..LEN_SIZE + encrypted_size].copy_from_slice(&tag);
            if padding > 0 {
                rand::thread_rng().fill_bytes(&mut self.buf[LEN_SIZE + encrypted_size..total]);
            }

            self.inner.write_all(&self.buf[..total]).await?;
            n += read_len;
        }
        self.inner.flush().await?;
        Ok(n)
    }

    /// Emit the tag-only terminator frame and shut the underlying writer down.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        let padding = self.shake.as_mut().map_or(0, |p| p.next_padding_len() as usize);
        let size_word = (TAG_SIZE + padding) as u16;
        let prefix = match self.shake.as_mut() {
            Some(p) => p.encode_size(size_word),
            None => size_word.to_be_bytes(),
        };
        self.buf[..LEN_SIZE].copy_from_slice(&prefix);

        let nonce = make_nonce(self.count, &self.iv);
        self.count = self.count.wrapping_add(1);
        let tag = self.cipher.seal_detached(&nonce, &mut [])?;
        self.buf[LEN_SIZE..LEN_SIZE + TAG_SIZE].copy_from_slice(&tag);

        let total = LEN_SIZE + TAG_SIZE + padding;
        if padding > 0 {
            rand::thread_rng().fill_bytes(&mut self.buf[LEN_SIZE + TAG_SIZE..total]);
        }
        self.inner.write_all(&self.buf[..total]).await?;
        self.inner.flush().await?;
        self.inner.shutdown().await
    }
}

/* ========================= Reader ========================= */

pub struct AeadReader<R> {
    inner: R,
    cipher: AeadCipher,
    iv: [u8; 16],
    count: u16,
    shake: Option<ShakeSizeParser>,
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
}

impl<R> Drop for AeadReader<R> {
    fn drop(&mut self) {
        pool::put_buffer(std::mem::take(&mut self.buf));
    }
}

impl<R: AsyncRead + Unpin> AeadReader<R> {
    pub fn new(inner: R, cipher: AeadCipher, iv: [u8; 16], shake: Option<ShakeSizeParser>) -> Self {
        AeadReader {
            inner,
            cipher,
            iv,
            count: 0,
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
        if size == TAG_SIZE {
            // tag-only terminator: drain and authenticate it so the
            // connection closes with nothing left unread
            let total = size + padding;
            self.inner.read_exact(&mut self.buf[..total]).await?;
            let nonce = make_nonce(self.count, &self.iv);
            self.count = self.count.wrapping_add(1);
            let (payload, tag) = self.buf[..size].split_at_mut(0);
            self.cipher.open_detached(&nonce, payload, tag)?;
            self.eof = true;
            return Ok(0);
        }
        if size < TAG_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk shorter than its tag",
            ));
        }

        let total = size + padding;
        if total > self.buf.len() {
            self.buf.resize(total, 0);
        }
        self.inner.read_exact(&mut self.buf[..total]).await?;

        let nonce = make_nonce(self.count, &self.iv);
        self.count = self.count.wrapping_add(1);
        let real_len = size - TAG_SIZE;
        let (payload, tag) = self.buf[..size].split_at_mut(real_len);
        self.cipher.open_detached(&nonce, payload, tag)?;

        let n = real_len.min(b.len());
        b[..n].copy_from_slice(&self.buf[..n]);
        self.start = n;
        self.end = real_len;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(256 * 1024)
    }

    async fn roundtrip(
        cipher_w: AeadCipher,
        cipher_r: AeadCipher,
        iv: [u8; 16],
        masking: bool,
        padding: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let (a, b) = pipe();
        let shake_w = masking.then(|| ShakeSizeParser::new(&iv, padding));
        let shake_r = masking.then(|| ShakeSizeParser::new(&iv, padding));
        let mut writer = AeadWriter::new(a, cipher_w, iv, shake_w);
        let mut reader = AeadReader::new(b, cipher_r, iv, shake_r);

        writer.write(payload).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_aes_gcm_roundtrip() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let payload = b"hello aead chunk stream".to_vec();
        let out = roundtrip(
            AeadCipher::aes_128_gcm(&key),
            AeadCipher::aes_128_gcm(&key),
            iv,
            false,
            false,
            &payload,
        )
        .await;
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_chacha_roundtrip_with_masking_and_padding() {
        let key = [0x33u8; 16];
        let iv = [0x44u8; 16];
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let out = roundtrip(
            AeadCipher::chacha20_poly1305(&key),
            AeadCipher::chacha20_poly1305(&key),
            iv,
            true,
            true,
            &payload,
        )
        .await;
        assert_eq!(out, payload, "multi-frame payload must survive masking+padding");
    }

    #[tokio::test]
    async fn test_residual_buffer_drains_across_small_reads() {
        let key = [0x55u8; 16];
        let iv = [0x66u8; 16];
        let payload = vec![0xA5u8; 1000];

        let (a, b) = pipe();
        let mut writer = AeadWriter::new(a, AeadCipher::aes_128_gcm(&key), iv, None);
        let mut reader = AeadReader::new(b, AeadCipher::aes_128_gcm(&key), iv, None);
        writer.write(&payload).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 33];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_tampered_frame_rejected() {
        let key = [0x77u8; 16];
        let iv = [0x88u8; 16];
        let (a, mut wire_rx) = pipe();
        let mut writer = AeadWriter::new(a, AeadCipher::aes_128_gcm(&key), iv, None);
        writer.write(b"payload under test").await.unwrap();

        // flip one ciphertext byte in transit
        let (mut raw, inner) = pipe();
        let mut wire = vec![0u8; 4096];
        let n = wire_rx.read(&mut wire).await.unwrap();
        wire[LEN_SIZE + 3] ^= 0x01;
        raw.write_all(&wire[..n]).await.unwrap();

        let mut reader = AeadReader::new(inner, AeadCipher::aes_128_gcm(&key), iv, None);
        let err = reader.read(&mut [0u8; 1024]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_plain_length_rejected() {
        let key = [0x99u8; 16];
        let iv = [0xAAu8; 16];
        let (mut a, b) = pipe();
        a.write_all(&((MAX_SIZE as u16) + 1).to_be_bytes()).await.unwrap();
        let mut reader = AeadReader::new(b, AeadCipher::aes_128_gcm(&key), iv, None);
        let err = reader.read(&mut [0u8; 16]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_nonce_counter_sequence() {
        let iv = [0xBCu8; 16];
        let mut prev = make_nonce(0, &iv);
        for count in 1..512u16 {
            let nonce = make_nonce(count, &iv);
            assert_eq!(&nonce[2..], &iv[2..12]);
            assert!(nonce[..2] > prev[..2], "counter prefix must be strictly increasing");
            prev = nonce;
        }
    }
}
