use crate::compression::StreamCompress;
use crate::errors::*;
use crate::proxy_common::proxy_conn;
use error_chain::{bail, ChainedError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::split;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

pub const DEFAULT_PORT: u16 = 9443;

pub fn run(
    local_addr: SocketAddr,
    upstreams: Vec<SocketAddr>,
    compress: StreamCompress,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().chain_err(|| "failed to create tokio runtime")?;

    rt.block_on(run_async(local_addr, upstreams, compress))
}

pub async fn run_async(
    local_addr: SocketAddr,
    upstreams: Vec<SocketAddr>,
    compress: StreamCompress,
) -> Result<()> {
    info!(%local_addr, role = %compress.role(), "opening listener socket");

    let listener = TcpListener::bind(local_addr)
        .await
        .chain_err(|| format!("error opening listener socket on {}", local_addr))?;

    serve(listener, upstreams, Arc::new(compress)).await
}

/// Accepts connections on `listener` forever. Each accepted connection is
/// wrapped in the configured role and relayed to the next upstream in turn.
pub async fn serve(
    listener: TcpListener,
    upstreams: Vec<SocketAddr>,
    compress: Arc<StreamCompress>,
) -> Result<()> {
    if upstreams.is_empty() {
        bail!(ErrorKind::Config("no upstream addresses".to_string()));
    }
    let mut upstream_carousel = upstreams.iter().cycle();

    loop {
        let (from_conn, from_addr) = listener
            .accept()
            .await
            .chain_err(|| "error accepting connection")?;
        info!(%from_addr, "connection received");

        let to_addr = *upstream_carousel
            .next()
            .chain_err(|| "upstream carousel failed to provide an address")?;

        let compress = Arc::clone(&compress);
        tokio::spawn(async move {
            if let Err(e) = handle_conn(from_conn, to_addr, &compress).await {
                error!(%from_addr, %to_addr, error = %e.display_chain(), "connection failed");
            }
        });
    }
}

async fn handle_conn(
    from_conn: TcpStream,
    to_addr: SocketAddr,
    compress: &StreamCompress,
) -> Result<()> {
    let to_conn = TcpStream::connect(to_addr)
        .await
        .chain_err(|| format!("failed to connect to {}", to_addr))?;
    info!(%to_addr, "connection opened");

    let wrapped = compress.wrap(from_conn)?;
    let (mut client_read, mut client_write) = split(wrapped);
    let (mut server_read, mut server_write) = split(to_conn);

    let (to_server, to_client) = tokio::join!(
        proxy_conn(&mut client_read, &mut server_write, "client -> upstream"),
        proxy_conn(&mut server_read, &mut client_write, "upstream -> client"),
    );
    debug!(
        %to_addr,
        to_server = ?to_server.as_ref().ok(),
        to_client = ?to_client.as_ref().ok(),
        "relay finished"
    );

    let mut wrapped = client_read.unsplit(client_write);
    let closed = wrapped
        .close()
        .await
        .chain_err(|| "error closing compressed connection");

    to_server.chain_err(|| "error relaying client to upstream")?;
    to_client.chain_err(|| "error relaying upstream to client")?;
    closed
}
