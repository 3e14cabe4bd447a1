//! VMess outbound: picks an identity at random, writes the auth token and the
//! AES-128-CFB-wrapped request header on first I/O, and frames data with the
//! negotiated chunk codec.

use std::error::Error;
use std::io;

use rand::{Rng, RngCore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::chunk::{DataReader, DataWriter};
use crate::config::Config;
use crate::crypto;
use crate::protocol::{Metadata, Security, CMD_TCP};
use crate::user::{parse_uuid, User};

pub struct Client {
    users: Vec<User>,
    security: Security,
    opt: u8,
    remote_host: String,
    remote_port: u16,
}

impl Client {
    pub fn new(config: &Config) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let uuid = parse_uuid(&config.uuid)
            .map_err(|e| format!("invalid uuid {:?}: {}", config.uuid, e))?;
        let root = User::new(uuid);
        let mut users = vec![root];
        users.extend(root.gen_alter_id_users(config.alter_id));
        let (security, opt) = config.security_options()?;
        Ok(Client {
            users,
            security,
            opt,
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
        })
    }

    /// Dial the vmess server and prepare a tunnel to `metadata`. Nothing is
    /// sent until the first read or write.
    pub async fn dial(&self, metadata: Metadata) -> io::Result<OutboundConn<TcpStream>> {
        let stream = TcpStream::connect((self.remote_host.as_str(), self.remote_port)).await?;
        debug!("dialed vmess server {}:{} for {}", self.remote_host, self.remote_port, metadata);
        Ok(self.wrap(stream, metadata))
    }

    /// Wrap an established underlay stream in an outbound connection.
    pub fn wrap<S>(&self, stream: S, metadata: Metadata) -> OutboundConn<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut rng = rand::thread_rng();
        let user = self.users[rng.gen_range(0..self.users.len())];

        let mut rand_bytes = [0u8; 32];
        rng.fill_bytes(&mut rand_bytes);
        let mut req_body_iv = [0u8; 16];
        let mut req_body_key = [0u8; 16];
        req_body_iv.copy_from_slice(&rand_bytes[..16]);
        req_body_key.copy_from_slice(&rand_bytes[16..]);
        let req_resp_v: u8 = rng.gen();

        let resp_body_iv = crypto::compute_md5(&req_body_iv);
        let resp_body_key = crypto::compute_md5(&req_body_key);

        let (read_half, write_half) = tokio::io::split(stream);
        OutboundConn {
            r: OutboundReadHalf {
                half: Some(read_half),
                reader: None,
                security: self.security,
                opt: self.opt,
                req_resp_v,
                resp_body_iv,
                resp_body_key,
            },
            w: OutboundWriteHalf {
                half: Some(write_half),
                writer: None,
                user,
                metadata,
                security: self.security,
                opt: self.opt,
                req_body_iv,
                req_body_key,
                req_resp_v,
            },
        }
    }
}

/* ========================= Write half ========================= */

pub struct OutboundWriteHalf<S> {
    half: Option<WriteHalf<S>>,
    writer: Option<DataWriter<WriteHalf<S>>>,
    user: User,
    metadata: Metadata,
    security: Security,
    opt: u8,
    req_body_iv: [u8; 16],
    req_body_key: [u8; 16],
    req_resp_v: u8,
}

impl<S: AsyncRead + AsyncWrite + Unpin> OutboundWriteHalf<S> {
    /// Send the auth token and the request header if they have not been sent
    /// yet, and install the data codec.
    pub async fn ensure_handshake(&mut self) -> io::Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let mut half = match self.half.take() {
            Some(h) => h,
            None => return Err(io::Error::new(io::ErrorKind::Other, "outbound writer lost")),
        };
        // one timestamp for both the token and the header IV
        let ts = crypto::unix_timestamp();
        let auth = crypto::hmac_md5(&self.user.uuid, &(ts as u64).to_be_bytes());
        half.write_all(&auth).await?;
        let request = self.build_request(ts);
        half.write_all(&request).await?;
        half.flush().await?;
        self.writer = Some(DataWriter::new(
            half,
            self.security,
            self.opt,
            &self.req_body_key,
            &self.req_body_iv,
        ));
        Ok(())
    }

    fn build_request(&self, ts: i64) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let mut buf = Vec::with_capacity(128);
        buf.push(1); // Ver
        buf.extend_from_slice(&self.req_body_iv);
        buf.extend_from_slice(&self.req_body_key);
        buf.push(self.req_resp_v);
        buf.push(self.opt);

        let padding_len: usize = rng.gen_range(0..16);
        buf.push(((padding_len as u8) << 4) | self.security.to_byte());
        buf.push(0); // reserved
        buf.push(CMD_TCP);
        buf.extend_from_slice(&self.metadata.port.to_be_bytes());
        self.metadata.address.encode_to(&mut buf);

        if padding_len > 0 {
            let mut padding = [0u8; 15];
            rng.fill_bytes(&mut padding[..padding_len]);
            buf.extend_from_slice(&padding[..padding_len]);
        }

        let checksum = crypto::fnv1a32(&buf);
        buf.extend_from_slice(&checksum.to_be_bytes());

        crypto::aes128_cfb_enc(&self.user.cmd_key, &crypto::timestamp_hash(ts)).encrypt(&mut buf);
        buf
    }

    pub async fn write(&mut self, b: &[u8]) -> io::Result<usize> {
        self.ensure_handshake().await?;
        match self.writer.as_mut() {
            Some(w) => w.write(b).await,
            None => Err(io::Error::new(io::ErrorKind::Other, "outbound writer lost")),
        }
    }

    /// Terminate the data stream and shut the transport down.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.ensure_handshake().await?;
        match self.writer.as_mut() {
            Some(w) => w.shutdown().await,
            None => Err(io::Error::new(io::ErrorKind::Other, "outbound writer lost")),
        }
    }
}

/* ========================= Read half ========================= */

pub struct OutboundReadHalf<S> {
    half: Option<ReadHalf<S>>,
    reader: Option<DataReader<ReadHalf<S>>>,
    security: Security,
    opt: u8,
    req_resp_v: u8,
    resp_body_iv: [u8; 16],
    resp_body_key: [u8; 16],
}

impl<S: AsyncRead + AsyncWrite + Unpin> OutboundReadHalf<S> {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reader.is_none() {
            let mut half = match self.half.take() {
                Some(h) => h,
                None => return Err(io::Error::new(io::ErrorKind::Other, "outbound reader lost")),
            };
            self.decode_response_header(&mut half).await?;
            self.reader = Some(DataReader::new(
                half,
                self.security,
                self.opt,
                &self.resp_body_key,
                &self.resp_body_iv,
            ));
        }
        match self.reader.as_mut() {
            Some(r) => r.read(buf).await,
            None => Err(io::Error::new(io::ErrorKind::Other, "outbound reader lost")),
        }
    }

    async fn decode_response_header(&mut self, half: &mut ReadHalf<S>) -> io::Result<()> {
        let mut header = [0u8; 4];
        half.read_exact(&mut header).await?;
        crypto::aes128_cfb_dec(&self.resp_body_key, &self.resp_body_iv).decrypt(&mut header);
        if header[0] != self.req_resp_v {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected response header",
            ));
        }
        if header[2] != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "dynamic port command not supported",
            ));
        }
        Ok(())
    }
}

/* ========================= Connection ========================= */

pub struct OutboundConn<S> {
    r: OutboundReadHalf<S>,
    w: OutboundWriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> OutboundConn<S> {
    pub fn metadata(&self) -> &Metadata {
        &self.w.metadata
    }

    pub async fn write(&mut self, b: &[u8]) -> io::Result<usize> {
        self.w.write(b).await
    }

    /// A first read also pushes the handshake out; the server cannot answer
    /// before it has seen the request.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.w.ensure_handshake().await?;
        self.r.read(buf).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.w.shutdown().await
    }

    /// Separate the halves for a bidirectional relay. The handshake is
    /// flushed first so the read side can make progress on its own.
    pub async fn into_split(
        mut self,
    ) -> io::Result<(OutboundReadHalf<S>, OutboundWriteHalf<S>)> {
        self.w.ensure_handshake().await?;
        Ok((self.r, self.w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ATYP_DOMAIN, OPT_BASIC_FORMAT};

    const SAMPLE_UUID: &str = "a684455c-b14f-11ea-bf0d-42010aaa0003";

    /// Decode the handshake a basic-format client emits, field by field.
    #[tokio::test]
    async fn test_request_header_layout() {
        let config = Config {
            uuid: SAMPLE_UUID.to_string(),
            ..Default::default()
        };
        let client = Client::new(&config).unwrap();
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut conn = client.wrap(local, Metadata::domain("example.com", 80));
        conn.write(b"87654321").await.unwrap();

        let mut auth = [0u8; 16];
        remote.read_exact(&mut auth).await.unwrap();
        let uuid = parse_uuid(SAMPLE_UUID).unwrap();
        let now = crypto::unix_timestamp();
        let ts = (now - 2..=now + 2)
            .find(|ts| crypto::hmac_md5(&uuid, &(*ts as u64).to_be_bytes()) == auth)
            .expect("auth token must match the current clock");

        let user = User::new(uuid);
        let mut cfb = crypto::aes128_cfb_dec(&user.cmd_key, &crypto::timestamp_hash(ts));
        let mut head = [0u8; 41];
        remote.read_exact(&mut head).await.unwrap();
        cfb.decrypt(&mut head);

        assert_eq!(head[0], 1, "version");
        assert_eq!(head[34], OPT_BASIC_FORMAT);
        let padding_len = (head[35] >> 4) as usize;
        assert_eq!(head[35] & 0x0f, Security::None.to_byte());
        assert_eq!(head[36], 0, "reserved");
        assert_eq!(head[37], CMD_TCP);
        assert_eq!(u16::from_be_bytes([head[38], head[39]]), 80);
        assert_eq!(head[40], ATYP_DOMAIN);

        let mut len_buf = [0u8; 1];
        remote.read_exact(&mut len_buf).await.unwrap();
        cfb.decrypt(&mut len_buf);
        let domain_len = len_buf[0] as usize;
        assert_eq!(domain_len, "example.com".len());

        let mut rest = vec![0u8; domain_len + padding_len + 4];
        remote.read_exact(&mut rest).await.unwrap();
        cfb.decrypt(&mut rest);
        assert_eq!(&rest[..domain_len], b"example.com");

        let mut full = Vec::new();
        full.extend_from_slice(&head);
        full.extend_from_slice(&len_buf);
        full.extend_from_slice(&rest[..domain_len + padding_len]);
        let expected = u32::from_be_bytes(rest[domain_len + padding_len..].try_into().unwrap());
        assert_eq!(crypto::fnv1a32(&full), expected, "FNV-1a over the whole request");

        // basic format: the payload follows unframed
        let mut payload = [0u8; 8];
        remote.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"87654321");
    }

    #[tokio::test]
    async fn test_handshake_sent_once() {
        let config = Config {
            uuid: SAMPLE_UUID.to_string(),
            security: "none".to_string(),
            ..Default::default()
        };
        let client = Client::new(&config).unwrap();
        let (local, mut remote) = tokio::io::duplex(8192);
        let mut conn = client.wrap(local, Metadata::domain("example.com", 80));

        conn.write(b"aa").await.unwrap();
        conn.write(b"bb").await.unwrap();
        conn.shutdown().await.unwrap();

        let mut wire = Vec::new();
        remote.read_to_end(&mut wire).await.unwrap();
        // auth(16) + request(41 + 1 + 11 + padding + 4) + two 2-payload
        // chunks of 4 bytes each + 2-byte zero-length terminator
        let padding = wire.len() - (16 + 41 + 1 + 11 + 4 + 4 + 4 + 2);
        assert!(padding < 16, "only the header padding may vary, got {}", padding);
    }
}
