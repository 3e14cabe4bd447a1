use std::env;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use vmessproxy::pool;
use vmessproxy::protocol::{Address, Metadata};
use vmessproxy::server::TcpInboundConn;
use vmessproxy::{Client, Config, Server};

fn print_usage() {
    println!("Usage: vmessproxy --mode server --config <file>");
    println!("       vmessproxy --mode forward --config <file> --listen <address:port> --target <host:port>");
    println!("Example: vmessproxy --mode server --config server.json");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let mut mode = None;
    let mut config_path = None;
    let mut listen = None;
    let mut target = None;

    for i in (1..args.len()).step_by(2) {
        match args[i].as_str() {
            "--mode" => {
                if i + 1 < args.len() {
                    mode = Some(args[i + 1].clone());
                }
            }
            "--config" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                }
            }
            "--listen" => {
                if i + 1 < args.len() {
                    listen = Some(args[i + 1].clone());
                }
            }
            "--target" => {
                if i + 1 < args.len() {
                    target = Some(args[i + 1].clone());
                }
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_usage();
                std::process::exit(1);
            }
        }
    }

    let mode = mode.ok_or("Missing --mode parameter")?;
    let config_path = config_path.ok_or("Missing --config parameter")?;
    let config = Config::load(&config_path)?;

    info!("vmessproxy {} starting in {} mode", env!("VMESSPROXY_VERSION"), mode);

    match mode.as_str() {
        "server" => run_server(config).await,
        "forward" => {
            let listen = listen.ok_or("Missing --listen parameter")?;
            let target = target.ok_or("Missing --target parameter")?;
            run_forward(config, listen, target).await
        }
        _ => {
            eprintln!("Mode must be either 'server' or 'forward'");
            print_usage();
            std::process::exit(1);
        }
    }
}

/* ========================= Server mode ========================= */

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut server = Server::bind(&config).await?;
    while let Some(conn) = server.accept_conn().await {
        tokio::spawn(async move {
            let peer = conn.peer_addr();
            if let Err(e) = relay_inbound(conn).await {
                debug!("relay for {} ended: {}", peer, e);
            }
        });
    }
    Ok(())
}

/// Dial the destination the handshake asked for and splice both directions.
async fn relay_inbound(conn: TcpInboundConn) -> io::Result<()> {
    let target = conn.metadata().target();
    let outbound = match TcpStream::connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("failed to connect to {}: {}", target, e);
            return Err(e);
        }
    };

    let (mut ci, mut cw) = conn.into_split();
    let (mut ro, mut wo) = outbound.into_split();

    let inbound_to_target = async {
        let mut buf = pool::get_buffer();
        let result = async {
            loop {
                let n = ci.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                wo.write_all(&buf[..n]).await?;
            }
            wo.shutdown().await
        }
        .await;
        pool::put_buffer(buf);
        result
    };
    let target_to_inbound = async {
        let mut buf = pool::get_buffer();
        let result = async {
            loop {
                let n = ro.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                cw.write(&buf[..n]).await?;
            }
            cw.shutdown().await
        }
        .await;
        pool::put_buffer(buf);
        result
    };

    tokio::try_join!(inbound_to_target, target_to_inbound)?;
    Ok(())
}

/* ========================= Forward mode ========================= */

async fn run_forward(
    config: Config,
    listen: String,
    target: String,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client = Arc::new(Client::new(&config)?);
    let metadata = parse_target(&target)?;
    let listener = TcpListener::bind(&listen).await?;
    info!("forwarding {} through the tunnel to {}", listen, metadata);

    loop {
        let (local, peer) = listener.accept().await?;
        let client = client.clone();
        let metadata = metadata.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_outbound(&client, local, metadata).await {
                debug!("forward for {} ended: {}", peer, e);
            }
        });
    }
}

fn parse_target(s: &str) -> Result<Metadata, Box<dyn std::error::Error + Send + Sync>> {
    let (host, port) = s.rsplit_once(':').ok_or("target must be host:port")?;
    let port: u16 = port.parse().map_err(|_| format!("invalid port in {}", s))?;
    let address = match host.parse::<IpAddr>() {
        Ok(ip) => Address::from_ip(ip),
        Err(_) => Address::Domain(host.to_string()),
    };
    Ok(Metadata::new(address, port))
}

async fn relay_outbound(client: &Client, local: TcpStream, metadata: Metadata) -> io::Result<()> {
    let conn = client.dial(metadata).await?;
    let (mut tr, mut tw) = conn.into_split().await?;
    let (mut lr, mut lw) = local.into_split();

    let local_to_tunnel = async {
        let mut buf = pool::get_buffer();
        let result = async {
            loop {
                let n = lr.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                tw.write(&buf[..n]).await?;
            }
            tw.shutdown().await
        }
        .await;
        pool::put_buffer(buf);
        result
    };
    let tunnel_to_local = async {
        let mut buf = pool::get_buffer();
        let result = async {
            loop {
                let n = tr.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                lw.write_all(&buf[..n]).await?;
            }
            lw.shutdown().await
        }
        .await;
        pool::put_buffer(buf);
        result
    };

    tokio::try_join!(local_to_tunnel, tunnel_to_local)?;
    Ok(())
}
