use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

pub struct MockTcpServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockTcpServer {
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn echo_server(self) {
        while let Ok((mut socket, addr)) = self.listener.accept().await {
            info!("Mock server accepted connection from {}", addr);

            tokio::spawn(async move {
                let mut buf = [0; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[0..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    }

    /// Record everything each connection sends and forward it to `tx`.
    /// Answers with `banner` first, like a talkative decoy service would.
    pub async fn recording_server(
        self,
        banner: &'static [u8],
        tx: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    ) {
        while let Ok((mut socket, addr)) = self.listener.accept().await {
            info!("Mock decoy accepted connection from {}", addr);
            let tx = tx.clone();

            tokio::spawn(async move {
                if socket.write_all(banner).await.is_err() {
                    return;
                }
                let mut received = Vec::new();
                let mut buf = [0; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => received.extend_from_slice(&buf[0..n]),
                    }
                }
                let _ = tx.send(received);
            });
        }
    }
}
