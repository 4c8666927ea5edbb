//! RPC client
//!
//! The free functions run one RPC over any [`Transport`]; [`Client`] opens a
//! fresh QUIC stream for each call.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use piecestore_core::bloom::BloomFilter;
use piecestore_core::signing;
use piecestore_core::{HashAlgorithm, Identity, Order, OrderLimit, PieceHash, PieceId};
use quinn::crypto::rustls::{NoInitialCipherSuite, QuicClientConfig};
use quinn::{
    ClientConfig, ConnectError, Connection, ConnectionError, Endpoint, RecvStream, SendStream,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{pki_types, ClientConfig as RustlsClientConfig, DigitallySignedStruct, SignatureScheme};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::error::Elapsed;
use tracing::debug;

use crate::constants::{MAX_ATTEMPTS, MAX_CHUNK_SIZE, PROTOCOL_VERSION, QUIC_CONNECTION_TIMEOUT};
use crate::error::ProtocolError;
use crate::message::{
    ChunkRequest, DeletePiecesRequest, DeletePiecesResponse, DeleteRequest, DeleteResponse,
    DownloadRequest, DownloadResponse, Method, PieceChunk, Preamble, Reply, RestoreTrashRequest,
    RestoreTrashResponse, RetainRequest, RetainResponse, SignedRequest, UploadRequest,
    UploadResponse,
};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to establish QUIC connection: {0}")]
    Connect(#[from] ConnectError),

    #[error("Lost the QUIC connection: {0}")]
    ConnectionError(#[from] ConnectionError),

    #[error("Timeout expired: {0}")]
    TimeoutExpired(#[from] Elapsed),

    #[error("Failed to create QUIC config: {0}")]
    ConfigError(#[from] NoInitialCipherSuite),

    #[error("Failed to create TLS config: {0}")]
    TlsError(#[from] rustls::Error),

    #[error("Failed to create endpoint: {0}")]
    EndpointCreationError(String),

    #[error("RPC failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Insecure certificate verifier that accepts all certificates.
///
/// Storage nodes present self-signed certificates; peers are authenticated by
/// the signatures on order limits, orders and piece hashes instead.
#[derive(Debug)]
pub struct InsecureCertVerifier;

impl ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &pki_types::CertificateDer<'_>,
        _intermediates: &[pki_types::CertificateDer<'_>],
        _server_name: &pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Client configuration options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientOptions {
    pub insecure: bool,
}

/// Configures a QUIC client with certificate verification.
/// Verification is skipped when `insecure` is set, which storage nodes with
/// self-signed certificates require.
pub fn configure_client(options: ClientOptions) -> Result<ClientConfig, ClientError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls_config = RustlsClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();

    if options.insecure {
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureCertVerifier));
    }

    let quic_config = QuicClientConfig::try_from(tls_config)?;
    Ok(ClientConfig::new(Arc::new(quic_config)))
}

/// Creates a QUIC client endpoint bound to specified address with automatic retries.
pub fn create_client_endpoint(
    bind_addr: SocketAddr,
    client_options: ClientOptions,
) -> Result<Endpoint, ClientError> {
    let client_cfg = configure_client(client_options)?;

    let mut attempts = 0;
    while attempts < MAX_ATTEMPTS {
        match Endpoint::client(bind_addr) {
            Ok(mut endpoint) => {
                endpoint.set_default_client_config(client_cfg.clone());
                return Ok(endpoint);
            }
            Err(_) if attempts < MAX_ATTEMPTS - 1 => {
                attempts += 1;
                std::thread::sleep(std::time::Duration::from_millis(100));
                continue;
            }
            Err(err) => return Err(ClientError::EndpointCreationError(format!("{err}"))),
        }
    }

    Err(ClientError::EndpointCreationError(
        "Exceeded maximum allowed attempts".into(),
    ))
}

/// Creates QUIC client connection with the provided endpoint and address.
pub async fn create_quic_client(
    client: &Endpoint,
    addr: SocketAddr,
) -> Result<Connection, ClientError> {
    debug!("Creating QUIC client connection to {addr}");

    let connection = tokio::time::timeout(QUIC_CONNECTION_TIMEOUT, async {
        let conn = client.connect(addr, "localhost")?;
        Ok::<_, ClientError>(conn.await?)
    })
    .await??;

    debug!("QUIC connection established successfully");
    Ok(connection)
}

/// Send a request. If the node already gave up on the stream, its error reply
/// is returned instead of the write failure.
async fn send_request<M, R, W>(
    transport: &mut Transport<R, W>,
    message: &M,
) -> Result<(), ProtocolError>
where
    M: Serialize,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match transport.send(message).await {
        Ok(()) => Ok(()),
        Err(err) => match transport.recv::<Reply<()>>().await {
            Ok(Some(Err(remote))) => Err(ProtocolError::Remote(remote)),
            _ => Err(err.into()),
        },
    }
}

async fn start<R, W>(transport: &mut Transport<R, W>, method: Method) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    send_request(
        transport,
        &Preamble {
            version: PROTOCOL_VERSION,
            method,
        },
    )
    .await
}

async fn reply<T, R, W>(transport: &mut Transport<R, W>) -> Result<Option<T>, ProtocolError>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    match transport.recv::<Reply<T>>().await? {
        Some(reply) => Ok(Some(reply?)),
        None => Ok(None),
    }
}

async fn unary<Req, Resp, R, W>(
    transport: &mut Transport<R, W>,
    method: Method,
    request: &Req,
) -> Result<Resp, ProtocolError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    start(transport, method).await?;
    send_request(transport, request).await?;
    transport.close().await?;
    reply(transport).await?.ok_or(ProtocolError::UnexpectedEof)
}

/// Upload `data` under `limit`, paying for each chunk just before sending it.
/// Returns the node's signed piece hash.
pub async fn upload<R, W>(
    transport: &mut Transport<R, W>,
    uplink: &Identity,
    limit: OrderLimit,
    data: &[u8],
    hash_algorithm: HashAlgorithm,
    chunk_size: usize,
) -> Result<PieceHash, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let piece_id = limit.piece_id;
    let node_id = limit.storage_node_id;
    let serial_number = limit.serial_number;

    start(transport, Method::Upload).await?;
    send_request(
        transport,
        &UploadRequest::Limit {
            limit,
            hash_algorithm,
        },
    )
    .await?;

    let mut offset = 0u64;
    for chunk in data.chunks(chunk_size.clamp(1, MAX_CHUNK_SIZE)) {
        let end = offset + chunk.len() as u64;
        let order = uplink
            .sign(Order {
                serial_number,
                amount: end,
                uplink_signature: Vec::new(),
            })
            .map_err(ProtocolError::Signing)?;
        send_request(transport, &UploadRequest::Order(order)).await?;
        send_request(
            transport,
            &UploadRequest::Chunk(PieceChunk {
                offset,
                data: chunk.to_vec(),
            }),
        )
        .await?;
        offset = end;
    }

    let piece_hash = uplink
        .sign(PieceHash {
            piece_id,
            hash: hash_algorithm.digest(data),
            piece_size: data.len() as u64,
            timestamp: Utc::now(),
            hash_algorithm,
            signature: Vec::new(),
        })
        .map_err(ProtocolError::Signing)?;
    send_request(transport, &UploadRequest::Done(piece_hash)).await?;

    let response: UploadResponse = reply(transport)
        .await?
        .ok_or(ProtocolError::UnexpectedEof)?;
    signing::verify(&node_id, &response.done)
        .map_err(|err| ProtocolError::Integrity(format!("node piece hash signature: {err}")))?;
    transport.close().await?;
    Ok(response.done)
}

/// A downloaded range and the uploader's signed hash of the whole piece.
#[derive(Clone, Debug)]
pub struct Downloaded {
    pub hash: PieceHash,
    pub original_limit: OrderLimit,
    pub data: Vec<u8>,
}

/// Download `size` bytes at `offset`, paying for the whole range up front.
/// A complete piece is checked against the uploader's hash.
pub async fn download<R, W>(
    transport: &mut Transport<R, W>,
    uplink: &Identity,
    limit: OrderLimit,
    offset: u64,
    size: u64,
) -> Result<Downloaded, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let order = uplink
        .sign(Order {
            serial_number: limit.serial_number,
            amount: size,
            uplink_signature: Vec::new(),
        })
        .map_err(ProtocolError::Signing)?;

    start(transport, Method::Download).await?;
    send_request(
        transport,
        &DownloadRequest::Limit {
            limit,
            chunk: ChunkRequest { offset, size },
        },
    )
    .await?;
    send_request(transport, &DownloadRequest::Order(order)).await?;
    transport.close().await?;

    let (hash, original_limit) = match reply(transport).await? {
        Some(DownloadResponse::Header { hash, limit }) => (hash, limit),
        Some(DownloadResponse::Chunk(_)) => {
            return Err(ProtocolError::Sequencing(
                "chunk received before the piece header".into(),
            ))
        }
        None => return Err(ProtocolError::UnexpectedEof),
    };
    signing::verify(&original_limit.uplink_public_key, &hash)
        .map_err(|err| ProtocolError::Integrity(format!("piece hash signature: {err}")))?;

    let available = hash.piece_size.saturating_sub(offset);
    let mut data = Vec::with_capacity(size.min(available) as usize);
    while let Some(response) = reply::<DownloadResponse, _, _>(transport).await? {
        let DownloadResponse::Chunk(chunk) = response else {
            return Err(ProtocolError::Sequencing("duplicate piece header".into()));
        };
        if chunk.offset != offset + data.len() as u64 {
            return Err(ProtocolError::Sequencing(format!(
                "chunk at offset {}, expected offset {}",
                chunk.offset,
                offset + data.len() as u64
            )));
        }
        data.extend_from_slice(&chunk.data);
        if data.len() as u64 > size {
            return Err(ProtocolError::Sequencing(format!(
                "received {} bytes, requested {size}",
                data.len()
            )));
        }
    }

    if data.len() as u64 != size {
        return Err(ProtocolError::UnexpectedEof);
    }
    if offset == 0 && size == hash.piece_size && hash.hash_algorithm.digest(&data) != hash.hash {
        return Err(ProtocolError::Integrity(
            "downloaded data does not match the piece hash".into(),
        ));
    }

    Ok(Downloaded {
        hash,
        original_limit,
        data,
    })
}

/// Deprecated single-piece delete.
pub async fn delete<R, W>(
    transport: &mut Transport<R, W>,
    limit: OrderLimit,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let _: DeleteResponse = unary(transport, Method::Delete, &DeleteRequest { limit }).await?;
    Ok(())
}

/// Delete pieces on behalf of `satellite`. Returns the unhandled count.
pub async fn delete_pieces<R, W>(
    transport: &mut Transport<R, W>,
    satellite: &Identity,
    piece_ids: Vec<PieceId>,
) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let request = SignedRequest::new(satellite, DeletePiecesRequest { piece_ids })
        .map_err(ProtocolError::Signing)?;
    let response: DeletePiecesResponse = unary(transport, Method::DeletePieces, &request).await?;
    Ok(response.unhandled_count)
}

pub async fn retain<R, W>(
    transport: &mut Transport<R, W>,
    satellite: &Identity,
    creation_date: DateTime<Utc>,
    filter: &BloomFilter,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let request = SignedRequest::new(
        satellite,
        RetainRequest {
            creation_date,
            filter: filter.to_bytes(),
        },
    )
    .map_err(ProtocolError::Signing)?;
    let _: RetainResponse = unary(transport, Method::Retain, &request).await?;
    Ok(())
}

pub async fn restore_trash<R, W>(
    transport: &mut Transport<R, W>,
    satellite: &Identity,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let request =
        SignedRequest::new(satellite, RestoreTrashRequest).map_err(ProtocolError::Signing)?;
    let _: RestoreTrashResponse = unary(transport, Method::RestoreTrash, &request).await?;
    Ok(())
}

/// A QUIC connection to one storage node.
pub struct Client {
    connection: Connection,
}

impl Client {
    pub async fn connect(endpoint: &Endpoint, addr: SocketAddr) -> Result<Self, ClientError> {
        Ok(Self {
            connection: create_quic_client(endpoint, addr).await?,
        })
    }

    async fn stream(&self) -> Result<Transport<RecvStream, SendStream>, ClientError> {
        let (send, recv) = self.connection.open_bi().await?;
        Ok(Transport::new(recv, send))
    }

    pub async fn upload(
        &self,
        uplink: &Identity,
        limit: OrderLimit,
        data: &[u8],
        hash_algorithm: HashAlgorithm,
    ) -> Result<PieceHash, ClientError> {
        let mut transport = self.stream().await?;
        Ok(upload(&mut transport, uplink, limit, data, hash_algorithm, MAX_CHUNK_SIZE).await?)
    }

    pub async fn download(
        &self,
        uplink: &Identity,
        limit: OrderLimit,
        offset: u64,
        size: u64,
    ) -> Result<Downloaded, ClientError> {
        let mut transport = self.stream().await?;
        Ok(download(&mut transport, uplink, limit, offset, size).await?)
    }

    pub async fn delete(&self, limit: OrderLimit) -> Result<(), ClientError> {
        let mut transport = self.stream().await?;
        Ok(delete(&mut transport, limit).await?)
    }

    pub async fn delete_pieces(
        &self,
        satellite: &Identity,
        piece_ids: Vec<PieceId>,
    ) -> Result<u64, ClientError> {
        let mut transport = self.stream().await?;
        Ok(delete_pieces(&mut transport, satellite, piece_ids).await?)
    }

    pub async fn retain(
        &self,
        satellite: &Identity,
        creation_date: DateTime<Utc>,
        filter: &BloomFilter,
    ) -> Result<(), ClientError> {
        let mut transport = self.stream().await?;
        Ok(retain(&mut transport, satellite, creation_date, filter).await?)
    }

    pub async fn restore_trash(&self, satellite: &Identity) -> Result<(), ClientError> {
        let mut transport = self.stream().await?;
        Ok(restore_trash(&mut transport, satellite).await?)
    }
}

#[cfg(test)]
mod tests {
    use piecestore_core::PieceAction;
    use piecestore_storage::Storage;
    use tokio::sync::watch;

    use super::*;
    use crate::endpoint::{Endpoint as PieceEndpoint, EndpointConfig};
    use crate::retain::{RetainConfig, RetainService};
    use crate::server;
    use crate::session::test_utils::Harness;

    #[tokio::test]
    async fn test_quic_roundtrip() {
        let h = Harness::new();
        let (_retain, queue) = RetainService::new(
            RetainConfig::default(),
            h.ctx.storage.clone(),
            h.ctx.in_flight.clone(),
        );
        let endpoint = Arc::new(PieceEndpoint::new(
            h.ctx.clone(),
            EndpointConfig::default(),
            queue,
        ));

        let quic = server::bind("127.0.0.1:0".parse().unwrap(), "127.0.0.1").unwrap();
        let addr = quic.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(server::serve(quic, endpoint, shutdown_rx));

        let client_endpoint = create_client_endpoint(
            "127.0.0.1:0".parse().unwrap(),
            ClientOptions { insecure: true },
        )
        .unwrap();
        let client = Client::connect(&client_endpoint, addr).await.unwrap();

        let piece_id = PieceId::generate();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let limit = h.limit(piece_id, PieceAction::Put, data.len() as u64);
        let node_hash = client
            .upload(&h.uplink, limit, &data, HashAlgorithm::Blake3)
            .await
            .unwrap();
        assert_eq!(node_hash.hash, HashAlgorithm::Blake3.digest(&data));

        let limit = h.limit(piece_id, PieceAction::Get, data.len() as u64);
        let downloaded = client
            .download(&h.uplink, limit, 0, data.len() as u64)
            .await
            .unwrap();
        assert_eq!(downloaded.data, data);

        let unhandled = client
            .delete_pieces(&h.satellite, vec![piece_id])
            .await
            .unwrap();
        assert_eq!(unhandled, 0);
        assert!(!h.ctx.storage.exists(&piece_id).await.unwrap());

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_download_range_larger_than_piece_fails_cleanly() {
        let h = Harness::new();
        let piece_id = PieceId::generate();
        let data = vec![5u8; 10];
        let limit = h.limit(piece_id, PieceAction::Get, u64::MAX);
        let hash = h.piece_hash(piece_id, &data);

        let (mut client, mut node) = crate::transport::memory_pair(1 << 16);
        let node_task = tokio::spawn(async move {
            let _: Preamble = node.recv().await.unwrap().unwrap();
            let request = node.recv::<DownloadRequest>().await.unwrap().unwrap();
            let DownloadRequest::Limit { limit, .. } = request else {
                panic!("expected the order limit first");
            };
            let _: DownloadRequest = node.recv().await.unwrap().unwrap();

            let header: Reply<DownloadResponse> = Ok(DownloadResponse::Header { hash, limit });
            node.send(&header).await.unwrap();
            let chunk: Reply<DownloadResponse> =
                Ok(DownloadResponse::Chunk(PieceChunk { offset: 0, data }));
            node.send(&chunk).await.unwrap();
            node.close().await.unwrap();
        });

        let err = download(&mut client, &h.uplink, limit, 0, u64::MAX / 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
        node_task.await.unwrap();
    }
}
