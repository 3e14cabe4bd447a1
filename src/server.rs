//! VMess inbound: the sliding-window auth table, handshake parsing, the
//! accept loop with decoy redirection, and the framed inbound connection.

use std::collections::HashMap;
use std::error::Error;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use crate::auth::{human_friendly_traffic, AuthUser, Authenticator};
use crate::chunk::{DataReader, DataWriter};
use crate::config::Config;
use crate::crypto;
use crate::protocol::{Address, Metadata, Security, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_TCP};
use crate::redirector;
use crate::rewind::RewindStream;
use crate::user::{parse_uuid, User};

const UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const CACHE_DURATION_SEC: i64 = 120;
const SESSION_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const CONN_CHANNEL_SIZE: usize = 32;

/* ========================= Replay/auth table ========================= */

struct UserAtTime {
    user: AuthUser,
    time_inc: i64,
    /// reserved: set when a token is seen in a replay attack
    tainted: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct SessionId {
    user: [u8; 16],
    key: [u8; 16],
    nonce: [u8; 16],
}

/// Pre-computed handshake tokens for every registered identity over a
/// sliding ±120 s window, plus the live-session index for replay detection.
struct ReplayTable {
    /// frozen at startup so `time_inc` stays small
    base_time: i64,
    user_hashes: RwLock<HashMap<[u8; 16], UserAtTime>>,
    session_history: RwLock<HashMap<SessionId, Instant>>,
}

impl ReplayTable {
    fn new(base_time: i64) -> Self {
        ReplayTable {
            base_time,
            user_hashes: RwLock::new(HashMap::with_capacity(1024)),
            session_history: RwLock::new(HashMap::with_capacity(128)),
        }
    }

    /// Generate tokens for `ts ∈ [now − 120, now + 120]` and purge entries
    /// that fell out of the window, then drop expired sessions.
    async fn refresh(&self, auth: &Authenticator) {
        let now = crypto::unix_timestamp();
        let gen_begin = now - CACHE_DURATION_SEC;
        let gen_end = now + CACHE_DURATION_SEC;
        {
            let mut hashes = self.user_hashes.write().await;
            for user in auth.list_users() {
                let uuid = user.uuid();
                for ts in gen_begin..=gen_end {
                    let token = crypto::hmac_md5(&uuid, &(ts as u64).to_be_bytes());
                    hashes.insert(
                        token,
                        UserAtTime {
                            user: user.clone(),
                            time_inc: ts - self.base_time,
                            tainted: false,
                        },
                    );
                }
            }
            if gen_begin > self.base_time {
                let base_time = self.base_time;
                hashes.retain(|_, entry| entry.time_inc + base_time >= gen_begin);
            }
        }

        let now = Instant::now();
        let mut sessions = self.session_history.write().await;
        sessions.retain(|_, expire| *expire > now);
    }

    /// Recover the identity and timestamp a token was generated for.
    async fn lookup(&self, token: &[u8; 16]) -> Option<(AuthUser, i64)> {
        let hashes = self.user_hashes.read().await;
        match hashes.get(token) {
            Some(entry) if !entry.tainted => {
                Some((entry.user.clone(), entry.time_inc + self.base_time))
            }
            _ => None,
        }
    }

    /// Record a session id; false if the same id is already live.
    async fn register_session(&self, sid: SessionId) -> bool {
        let mut sessions = self.session_history.write().await;
        let now = Instant::now();
        if let Some(expire) = sessions.get(&sid) {
            if *expire > now {
                return false;
            }
        }
        sessions.insert(sid, now + SESSION_TIMEOUT);
        true
    }
}

/* ========================= Inbound connection ========================= */

struct ConnShared {
    user: AuthUser,
    metadata: Metadata,
    peer_addr: SocketAddr,
    sent: AtomicU64,
    recv: AtomicU64,
}

impl Drop for ConnShared {
    fn drop(&mut self) {
        self.user.del_ip(&self.peer_addr.ip());
        info!(
            "connection from {} tunneling to {} closed, sent: {}, recv: {}",
            self.peer_addr,
            self.metadata,
            human_friendly_traffic(self.sent.load(Ordering::Relaxed)),
            human_friendly_traffic(self.recv.load(Ordering::Relaxed)),
        );
    }
}

/// Everything the handshake learned about a connection.
#[derive(Debug)]
struct Handshake {
    user: AuthUser,
    metadata: Metadata,
    req_body_iv: [u8; 16],
    req_body_key: [u8; 16],
    req_resp_v: u8,
    opt: u8,
    security: Security,
}

pub struct InboundReadHalf<S> {
    half: Option<ReadHalf<S>>,
    reader: Option<DataReader<ReadHalf<S>>>,
    security: Security,
    opt: u8,
    req_body_iv: [u8; 16],
    req_body_key: [u8; 16],
    shared: Arc<ConnShared>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> InboundReadHalf<S> {
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.reader.is_none() {
            match self.half.take() {
                Some(half) => {
                    self.reader = Some(DataReader::new(
                        half,
                        self.security,
                        self.opt,
                        &self.req_body_key,
                        &self.req_body_iv,
                    ));
                }
                None => {
                    return Err(io::Error::new(io::ErrorKind::Other, "inbound reader lost"))
                }
            }
        }
        match self.reader.as_mut() {
            Some(r) => {
                let n = r.read(buf).await?;
                self.shared.recv.fetch_add(n as u64, Ordering::Relaxed);
                self.shared.user.add_traffic(0, n as u64);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "inbound reader lost")),
        }
    }
}

pub struct InboundWriteHalf<S> {
    half: Option<WriteHalf<S>>,
    writer: Option<DataWriter<WriteHalf<S>>>,
    security: Security,
    opt: u8,
    req_body_iv: [u8; 16],
    req_body_key: [u8; 16],
    req_resp_v: u8,
    shared: Arc<ConnShared>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> InboundWriteHalf<S> {
    /// The first write emits the response header, then installs the data
    /// codec keyed symmetrically to the client's reader.
    pub async fn write(&mut self, b: &[u8]) -> io::Result<usize> {
        if self.writer.is_none() {
            let mut half = match self.half.take() {
                Some(h) => h,
                None => return Err(io::Error::new(io::ErrorKind::Other, "inbound writer lost")),
            };
            let resp_body_key = crypto::compute_md5(&self.req_body_key);
            let resp_body_iv = crypto::compute_md5(&self.req_body_iv);

            // response auth V, mirrored options, no dynamic port command
            let mut header = [self.req_resp_v, self.opt, 0, 0];
            crypto::aes128_cfb_enc(&resp_body_key, &resp_body_iv).encrypt(&mut header);
            half.write_all(&header).await?;

            self.writer = Some(DataWriter::new(
                half,
                self.security,
                self.opt,
                &resp_body_key,
                &resp_body_iv,
            ));
        }
        match self.writer.as_mut() {
            Some(w) => {
                let n = w.write(b).await?;
                self.shared.sent.fetch_add(n as u64, Ordering::Relaxed);
                self.shared.user.add_traffic(n as u64, 0);
                Ok(n)
            }
            None => Err(io::Error::new(io::ErrorKind::Other, "inbound writer lost")),
        }
    }

    /// Terminate the data stream. A connection that never wrote anything is
    /// closed silently, without betraying the protocol.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        if let Some(w) = self.writer.as_mut() {
            return w.shutdown().await;
        }
        match self.half.as_mut() {
            Some(h) => h.shutdown().await,
            None => Ok(()),
        }
    }
}

pub struct InboundConn<S> {
    r: InboundReadHalf<S>,
    w: InboundWriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> InboundConn<S> {
    fn new(stream: S, hs: Handshake, peer_addr: SocketAddr) -> Self {
        let shared = Arc::new(ConnShared {
            user: hs.user,
            metadata: hs.metadata,
            peer_addr,
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
        });
        let (read_half, write_half) = tokio::io::split(stream);
        InboundConn {
            r: InboundReadHalf {
                half: Some(read_half),
                reader: None,
                security: hs.security,
                opt: hs.opt,
                req_body_iv: hs.req_body_iv,
                req_body_key: hs.req_body_key,
                shared: shared.clone(),
            },
            w: InboundWriteHalf {
                half: Some(write_half),
                writer: None,
                security: hs.security,
                opt: hs.opt,
                req_body_iv: hs.req_body_iv,
                req_body_key: hs.req_body_key,
                req_resp_v: hs.req_resp_v,
                shared,
            },
        }
    }

    /// Destination requested by the client.
    pub fn metadata(&self) -> &Metadata {
        &self.r.shared.metadata
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.r.shared.peer_addr
    }

    /// (sent, received) byte totals of this connection.
    pub fn traffic(&self) -> (u64, u64) {
        (
            self.r.shared.sent.load(Ordering::Relaxed),
            self.r.shared.recv.load(Ordering::Relaxed),
        )
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.r.read(buf).await
    }

    pub async fn write(&mut self, b: &[u8]) -> io::Result<usize> {
        self.w.write(b).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.w.shutdown().await
    }

    /// Separate the halves for a bidirectional relay.
    pub fn into_split(self) -> (InboundReadHalf<S>, InboundWriteHalf<S>) {
        (self.r, self.w)
    }
}

/* ========================= Handshake ========================= */

async fn handshake<S>(
    table: &ReplayTable,
    stream: &mut S,
    peer_addr: SocketAddr,
) -> io::Result<Handshake>
where
    S: AsyncRead + Unpin,
{
    let mut token = [0u8; 16];
    stream.read_exact(&mut token).await?;
    let (user, timestamp) = table.lookup(&token).await.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "unknown or tainted auth token")
    })?;

    // the request is a single AES-128-CFB stream across all remaining reads
    let cmd_key = user.cmd_key();
    let mut cfb = crypto::aes128_cfb_dec(&cmd_key, &crypto::timestamp_hash(timestamp));

    let mut req = [0u8; 41];
    stream.read_exact(&mut req).await?;
    cfb.decrypt(&mut req);
    let mut full_req = Vec::with_capacity(64);
    full_req.extend_from_slice(&req);

    if req[0] != 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported request version",
        ));
    }

    let mut req_body_iv = [0u8; 16];
    let mut req_body_key = [0u8; 16];
    req_body_iv.copy_from_slice(&req[1..17]);
    req_body_key.copy_from_slice(&req[17..33]);

    let sid = SessionId {
        user: user.uuid(),
        key: req_body_key,
        nonce: req_body_iv,
    };
    if !table.register_session(sid).await {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "duplicated session id",
        ));
    }

    let req_resp_v = req[33];
    let opt = req[34];
    let padding_len = (req[35] >> 4) as usize;
    let security = Security::from_byte(req[35] & 0x0f).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "unsupported security type")
    })?;
    let cmd = req[37];
    if cmd != CMD_TCP {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported command {}", cmd),
        ));
    }
    let port = u16::from_be_bytes([req[38], req[39]]);

    let atyp = req[40];
    let addr_len = match atyp {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            cfb.decrypt(&mut len_buf);
            full_req.extend_from_slice(&len_buf);
            len_buf[0] as usize
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address type {}", other),
            ))
        }
    };

    let mut remaining = vec![0u8; addr_len + padding_len + 4];
    stream.read_exact(&mut remaining).await?;
    cfb.decrypt(&mut remaining);
    full_req.extend_from_slice(&remaining);

    let address = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&remaining[..4]);
            Address::Ipv4(Ipv4Addr::from(octets))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&remaining[..16]);
            Address::Ipv6(Ipv6Addr::from(octets))
        }
        _ => Address::Domain(String::from_utf8_lossy(&remaining[..addr_len]).to_string()),
    };

    let body_len = full_req.len() - 4;
    let expected = u32::from_be_bytes([
        full_req[body_len],
        full_req[body_len + 1],
        full_req[body_len + 2],
        full_req[body_len + 3],
    ]);
    if crypto::fnv1a32(&full_req[..body_len]) != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request checksum mismatch",
        ));
    }

    if !user.add_ip(peer_addr.ip()) {
        return Err(io::Error::new(io::ErrorKind::Other, "ip limit reached"));
    }

    Ok(Handshake {
        user,
        metadata: Metadata::new(address, port),
        req_body_iv,
        req_body_key,
        req_resp_v,
        opt,
        security,
    })
}

/* ========================= Server ========================= */

struct ServerState {
    auth: Authenticator,
    table: ReplayTable,
    redir_host: String,
    redir_port: u16,
}

pub type TcpInboundConn = InboundConn<RewindStream<TcpStream>>;

pub struct Server {
    conn_rx: mpsc::Receiver<TcpInboundConn>,
    local_addr: SocketAddr,
    quit: broadcast::Sender<()>,
}

impl Server {
    /// Bind the listener, prime the auth table, and start the accept and
    /// refresh loops.
    pub async fn bind(config: &Config) -> Result<Server, Box<dyn Error + Send + Sync>> {
        if config.remote_host.is_empty() {
            return Err("vmess server requires a decoy redirect address".into());
        }
        let uuid = parse_uuid(&config.uuid)
            .map_err(|e| format!("invalid uuid {:?}: {}", config.uuid, e))?;
        let auth = Authenticator::new();
        auth.add_user(User::new(uuid), config.alter_id, config.ip_limit);

        let listener =
            TcpListener::bind((config.local_host.as_str(), config.local_port)).await?;
        let local_addr = listener.local_addr()?;

        let base_time = crypto::unix_timestamp() - CACHE_DURATION_SEC * 2;
        let state = Arc::new(ServerState {
            auth,
            table: ReplayTable::new(base_time),
            redir_host: config.remote_host.clone(),
            redir_port: config.remote_port,
        });
        // tokens must exist before the first connection arrives
        state.table.refresh(&state.auth).await;

        let (conn_tx, conn_rx) = mpsc::channel(CONN_CHANNEL_SIZE);
        let (quit, _) = broadcast::channel(1);
        tokio::spawn(refresh_loop(state.clone(), quit.subscribe()));
        tokio::spawn(accept_loop(listener, state, conn_tx, quit.subscribe()));

        info!("vmess server listening on {}", local_addr);
        Ok(Server {
            conn_rx,
            local_addr,
            quit,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next authenticated connection; `None` once the server is closed.
    pub async fn accept_conn(&mut self) -> Option<TcpInboundConn> {
        self.conn_rx.recv().await
    }

    /// Stop the accept and refresh loops. In-flight connections finish on
    /// their own.
    pub fn close(&self) {
        let _ = self.quit.send(());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    conn_tx: mpsc::Sender<TcpInboundConn>,
    mut quit: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, peer_addr)) => {
                    let state = state.clone();
                    let conn_tx = conn_tx.clone();
                    tokio::spawn(handle_conn(conn, peer_addr, state, conn_tx));
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = quit.recv() => {
                debug!("vmess accept loop exiting");
                return;
            }
        }
    }
}

async fn handle_conn(
    conn: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    conn_tx: mpsc::Sender<TcpInboundConn>,
) {
    let mut rewind = RewindStream::new(conn);
    match handshake(&state.table, &mut rewind, peer_addr).await {
        Ok(hs) => {
            rewind.stop_buffering();
            debug!("vmess connection from {} to {}", peer_addr, hs.metadata);
            let inbound = InboundConn::new(rewind, hs, peer_addr);
            if conn_tx.send(inbound).await.is_err() {
                debug!("connection channel closed, dropping {}", peer_addr);
            }
        }
        Err(e) => {
            // never answer on our own: replay everything to the decoy so a
            // prober sees nothing but the decoy service
            warn!("connection with invalid vmess header from {}: {}", peer_addr, e);
            rewind.rewind();
            rewind.stop_buffering();
            if let Err(e) =
                redirector::redirect(rewind, &state.redir_host, state.redir_port).await
            {
                debug!("decoy redirect for {} failed: {}", peer_addr, e);
            }
        }
    }
}

async fn refresh_loop(state: Arc<ServerState>, mut quit: broadcast::Receiver<()>) {
    let mut ticker = interval(UPDATE_INTERVAL);
    ticker.tick().await; // the table was primed at bind time
    loop {
        tokio::select! {
            _ = ticker.tick() => state.table.refresh(&state.auth).await,
            _ = quit.recv() => {
                debug!("vmess auth table refresh loop exiting");
                return;
            }
        }
    }
}
