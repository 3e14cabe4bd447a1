//! SHAKE-128 driven chunk-length obfuscation.
//!
//! Both peers seed a parser with the body IV of the direction and pull masks
//! in lockstep: one 16-bit word per padding query, one per length. Consumers
//! must always take the padding length *before* the size for a chunk, in both
//! directions, or the keystreams drift apart.

use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::{Shake128, Shake128Reader};

pub struct ShakeSizeParser {
    reader: Shake128Reader,
    word: [u8; 2],
    padding: bool,
}

impl ShakeSizeParser {
    pub fn new(nonce: &[u8], padding: bool) -> Self {
        let mut hasher = Shake128::default();
        Update::update(&mut hasher, nonce);
        ShakeSizeParser {
            reader: hasher.finalize_xof(),
            word: [0u8; 2],
            padding,
        }
    }

    fn next_word(&mut self) -> u16 {
        XofReader::read(&mut self.reader, &mut self.word);
        u16::from_be_bytes(self.word)
    }

    pub fn encode_size(&mut self, size: u16) -> [u8; 2] {
        (size ^ self.next_word()).to_be_bytes()
    }

    pub fn decode_size(&mut self, encoded: [u8; 2]) -> u16 {
        u16::from_be_bytes(encoded) ^ self.next_word()
    }

    /// Padding length for the next chunk, in `[0, 64)`. Returns 0 without
    /// consuming keystream when padding is disabled.
    pub fn next_padding_len(&mut self) -> u16 {
        if !self.padding {
            return 0;
        }
        self.next_word() % 64
    }

    pub fn padding_enabled(&self) -> bool {
        self.padding
    }
}
