//! Thin adapters over the primitives the legacy VMess handshake uses:
//! MD5, HMAC-MD5, AES-128-CFB, FNV-1a-32 and the derived keys built from them.

use std::time::{SystemTime, UNIX_EPOCH};

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

/// Streaming AES-128-CFB, partial-block safe. The server decrypts the request
/// header across several reads with a single keystream, so the buffered
/// variants are required.
pub type Aes128CfbEnc = cfb_mode::BufEncryptor<Aes128>;
pub type Aes128CfbDec = cfb_mode::BufDecryptor<Aes128>;

pub fn aes128_cfb_enc(key: &[u8; 16], iv: &[u8; 16]) -> Aes128CfbEnc {
    Aes128CfbEnc::new(key.into(), iv.into())
}

pub fn aes128_cfb_dec(key: &[u8; 16], iv: &[u8; 16]) -> Aes128CfbDec {
    Aes128CfbDec::new(key.into(), iv.into())
}

pub fn compute_md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac =
        <Hmac<Md5> as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Request header IV: MD5 of the big-endian timestamp repeated four times.
pub fn timestamp_hash(ts: i64) -> [u8; 16] {
    let b = (ts as u64).to_be_bytes();
    let mut hasher = Md5::new();
    for _ in 0..4 {
        hasher.update(b);
    }
    hasher.finalize().into()
}

/// ChaCha20-Poly1305 data key: MD5(key) followed by MD5(MD5(key)).
pub fn chacha20poly1305_key(key: &[u8; 16]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let first = compute_md5(key);
    out[..16].copy_from_slice(&first);
    out[16..].copy_from_slice(&compute_md5(&first));
    out
}

pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5; // FNV-1a 32-bit offset basis
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193); // FNV-1a 32-bit prime
    }
    hash
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32() {
        // Known FNV-1a values
        assert_eq!(fnv1a32(b""), 0x811c9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c292c);
    }

    #[test]
    fn test_timestamp_hash_matches_repeated_md5() {
        let ts = 1_592_000_000i64;
        let mut quad = Vec::new();
        for _ in 0..4 {
            quad.extend_from_slice(&(ts as u64).to_be_bytes());
        }
        assert_eq!(timestamp_hash(ts), compute_md5(&quad));
    }

    #[test]
    fn test_hmac_md5_known_vector() {
        // RFC 2202 test case 2
        let out = hmac_md5(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            out,
            [
                0x75, 0x0c, 0x78, 0x3e, 0x6a, 0xb0, 0xb5, 0x03, 0xea, 0xa8, 0x6e, 0x31,
                0x0a, 0x5d, 0xb7, 0x38,
            ]
        );
    }

    #[test]
    fn test_cfb_roundtrip_across_split_reads() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let mut data = *b"the quick brown fox jumps over the lazy dog";
        aes128_cfb_enc(&key, &iv).encrypt(&mut data);

        // Decrypting in uneven pieces must match a one-shot decrypt.
        let mut split = data;
        let mut dec = aes128_cfb_dec(&key, &iv);
        dec.decrypt(&mut split[..7]);
        dec.decrypt(&mut split[7..30]);
        dec.decrypt(&mut split[30..]);
        assert_eq!(&split[..], b"the quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn test_chacha_key_derivation() {
        let key = [1u8; 16];
        let derived = chacha20poly1305_key(&key);
        assert_eq!(&derived[..16], &compute_md5(&key));
        assert_eq!(&derived[16..], &compute_md5(&compute_md5(&key)));
    }
}
