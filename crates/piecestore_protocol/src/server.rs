//! QUIC server

use std::net::SocketAddr;
use std::sync::Arc;

use piecestore_storage::Storage;
use quinn::rustls::pki_types::PrivatePkcs8KeyDer;
use quinn::{Connection, ServerConfig};
use rcgen::{generate_simple_self_signed, Error as RcgenError};
use rustls::Error as RustlsError;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::endpoint::Endpoint;
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("rcgen error: {0}")]
    RcgenError(#[from] RcgenError),

    #[error("rustls error: {0}")]
    RustlsError(#[from] RustlsError),

    #[error("Failed to bind QUIC endpoint: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a self-signed cert for `localhost` and the external IP.
pub fn configure_server(external_ip: &str) -> Result<ServerConfig, ServerError> {
    let cert = generate_simple_self_signed(vec!["localhost".into(), external_ip.into()])?;
    let cert_der = cert.cert;
    let key_der = cert.key_pair.serialize_der();
    let priv_key = PrivatePkcs8KeyDer::from(key_der);

    let server_config = ServerConfig::with_single_cert(vec![cert_der.into()], priv_key.into())?;
    Ok(server_config)
}

/// Bind a QUIC endpoint on `addr` with a certificate for `external_ip`.
pub fn bind(addr: SocketAddr, external_ip: &str) -> Result<quinn::Endpoint, ServerError> {
    let server_config = configure_server(external_ip)?;
    Ok(quinn::Endpoint::server(server_config, addr)?)
}

/// Accept connections until shutdown is signalled. Every bidirectional stream
/// is served as one RPC on its own task.
pub async fn serve<S>(
    quic: quinn::Endpoint,
    endpoint: Arc<Endpoint<S>>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Storage + 'static,
{
    info!("Piecestore listening on {:?}", quic.local_addr());
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Server received shutdown signal");
                    break;
                }
            }
            incoming = quic.accept() => {
                let Some(incoming) = incoming else { break };
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => handle_connection(conn, endpoint).await,
                        Err(err) => error!("Connection failed: {err}"),
                    }
                });
            }
        }
    }
    quic.close(0u32.into(), b"shutdown");
}

async fn handle_connection<S>(conn: Connection, endpoint: Arc<Endpoint<S>>)
where
    S: Storage + 'static,
{
    debug!("New connection from {}", conn.remote_address());
    while let Ok((send, recv)) = conn.accept_bi().await {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            // Errors are logged and reported to the peer by dispatch.
            let _ = endpoint.dispatch(Transport::new(recv, send)).await;
        });
    }
    debug!("Connection from {} closed", conn.remote_address());
}
