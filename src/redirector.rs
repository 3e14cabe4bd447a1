//! Routes connections that failed the handshake to the decoy target. The
//! caller rewinds the inbound stream first, so the decoy sees exactly the
//! bytes the probe sent and answers with its own banner; the prober cannot
//! tell this listener from the decoy service.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

pub async fn redirect<S>(inbound: S, host: &str, port: u16) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outbound = TcpStream::connect((host, port)).await?;

    let (mut ri, mut wi) = tokio::io::split(inbound);
    let (mut ro, mut wo) = outbound.into_split();

    let client_to_decoy = async {
        let n = tokio::io::copy(&mut ri, &mut wo).await?;
        wo.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };
    let decoy_to_client = async {
        let n = tokio::io::copy(&mut ro, &mut wi).await?;
        wi.shutdown().await?;
        Ok::<u64, io::Error>(n)
    };

    let (sent, received) = tokio::try_join!(client_to_decoy, decoy_to_client)?;
    debug!(
        "redirected connection finished, {} bytes to decoy, {} bytes back",
        sent, received
    );
    Ok(())
}
