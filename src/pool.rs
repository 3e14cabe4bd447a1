//! Relay buffer reuse for the chunk codecs. Each codec draws one buffer at
//! construction and hands it back on drop, so every acquisition is paired
//! with a release no matter which exit path a connection takes.

use std::sync::Mutex;

/// Scratch/residual buffer size. Covers a maximal non-masked frame
/// (17 KiB) with headroom.
pub const RELAY_BUFFER_SIZE: usize = 20 * 1024;

const MAX_POOLED: usize = 64;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

pub fn get_buffer() -> Vec<u8> {
    if let Ok(mut pool) = POOL.lock() {
        if let Some(mut buf) = pool.pop() {
            buf.resize(RELAY_BUFFER_SIZE, 0);
            return buf;
        }
    }
    vec![0u8; RELAY_BUFFER_SIZE]
}

pub fn put_buffer(buf: Vec<u8>) {
    if buf.capacity() < RELAY_BUFFER_SIZE {
        return;
    }
    if let Ok(mut pool) = POOL.lock() {
        if pool.len() < MAX_POOLED {
            pool.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sized_and_recycled() {
        let buf = get_buffer();
        assert_eq!(buf.len(), RELAY_BUFFER_SIZE);
        put_buffer(buf);
        let again = get_buffer();
        assert_eq!(again.len(), RELAY_BUFFER_SIZE);
    }

    #[test]
    fn test_undersized_buffer_not_pooled() {
        put_buffer(vec![0u8; 16]);
        assert_eq!(get_buffer().len(), RELAY_BUFFER_SIZE);
    }
}
