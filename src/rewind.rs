//! A connection wrapper that records early bytes so a failed handshake can be
//! replayed verbatim to the decoy target.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Upper bound on recorded bytes; the largest possible handshake is well
/// under this.
pub const HANDSHAKE_BUFFER_SIZE: usize = 4086;

pub struct RewindStream<S> {
    inner: S,
    record: Vec<u8>,
    replay_from: Option<usize>,
    buffering: bool,
}

impl<S> RewindStream<S> {
    pub fn new(inner: S) -> Self {
        RewindStream {
            inner,
            record: Vec::new(),
            replay_from: None,
            buffering: true,
        }
    }

    /// Serve all recorded bytes again before touching the underlying stream.
    pub fn rewind(&mut self) {
        self.replay_from = Some(0);
    }

    /// Stop recording. The record is released once no replay is pending.
    pub fn stop_buffering(&mut self) {
        self.buffering = false;
        if self.replay_from.is_none() {
            self.record = Vec::new();
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(pos) = this.replay_from {
            if pos < this.record.len() {
                let n = buf.remaining().min(this.record.len() - pos);
                buf.put_slice(&this.record[pos..pos + n]);
                this.replay_from = Some(pos + n);
                return Poll::Ready(Ok(()));
            }
            this.replay_from = None;
            if !this.buffering {
                this.record = Vec::new();
            }
        }

        let filled = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if this.buffering {
                    let newly = &buf.filled()[filled..];
                    if this.record.len() + newly.len() > HANDSHAKE_BUFFER_SIZE {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "handshake exceeds rewind buffer",
                        )));
                    }
                    this.record.extend_from_slice(newly);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_rewind_replays_consumed_bytes() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        tx.write_all(b"0123456789abcdef").await.unwrap();

        let mut stream = RewindStream::new(rx);
        let mut head = [0u8; 10];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"0123456789");

        stream.rewind();
        stream.stop_buffering();
        let mut replay = [0u8; 16];
        stream.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_stop_buffering_passthrough() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        tx.write_all(b"headerpayload").await.unwrap();

        let mut stream = RewindStream::new(rx);
        let mut head = [0u8; 6];
        stream.read_exact(&mut head).await.unwrap();
        stream.stop_buffering();

        let mut rest = [0u8; 7];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }

    #[tokio::test]
    async fn test_record_overflow_rejected() {
        let (mut tx, rx) = tokio::io::duplex(16 * 1024);
        tx.write_all(&vec![0u8; HANDSHAKE_BUFFER_SIZE + 1]).await.unwrap();

        let mut stream = RewindStream::new(rx);
        let mut sink = vec![0u8; HANDSHAKE_BUFFER_SIZE + 1];
        let err = stream.read_exact(&mut sink).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
