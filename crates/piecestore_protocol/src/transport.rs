//! Message framing: length-delimited frames carrying bincode-encoded values.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use piecestore_core::encoding;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::constants::MAX_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode or decode message: {0}")]
    Codec(#[from] bincode::Error),
}

/// Typed message stream over a pair of byte streams.
pub struct Transport<R, W> {
    reader: FramedRead<R, LengthDelimitedCodec>,
    writer: FramedWrite<W, LengthDelimitedCodec>,
}

pub type MemoryTransport = Transport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, codec()),
            writer: FramedWrite::new(writer, codec()),
        }
    }

    /// Next message, or `None` once the peer has closed its side.
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, TransportError> {
        match self.reader.next().await {
            Some(frame) => Ok(Some(encoding::deserialize(&frame?)?)),
            None => Ok(None),
        }
    }

    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<(), TransportError> {
        let bytes = encoding::serialize(message)?;
        self.writer.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Flush and close our side. The peer sees end of stream.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::<Bytes>::close(&mut self.writer).await?;
        Ok(())
    }
}

/// Two connected in-process transports.
pub fn memory_pair(buffer_size: usize) -> (MemoryTransport, MemoryTransport) {
    let (a, b) = tokio::io::duplex(buffer_size);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        Transport::new(a_read, a_write),
        Transport::new(b_read, b_write),
    )
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Deserialize, Serialize)]
    struct Ping {
        seq: u32,
        payload: Vec<u8>,
    }

    #[tokio::test]
    async fn test_send_recv_and_close() {
        let (mut client, mut server) = memory_pair(1024);

        let sent = Ping {
            seq: 7,
            payload: vec![1; 4000],
        };
        let sender = tokio::spawn(async move {
            client.send(&sent).await.unwrap();
            client.close().await.unwrap();
        });

        let received: Ping = server.recv().await.unwrap().unwrap();
        assert_eq!(received.seq, 7);
        assert_eq!(received.payload.len(), 4000);
        assert!(server.recv::<Ping>().await.unwrap().is_none());
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_any_message_ends_the_stream() {
        let (mut client, mut server) = memory_pair(64);
        client.close().await.unwrap();
        assert!(server.recv::<Ping>().await.unwrap().is_none());

        // The other direction stays open.
        server
            .send(&Ping {
                seq: 1,
                payload: Vec::new(),
            })
            .await
            .unwrap();
        let reply: Ping = client.recv().await.unwrap().unwrap();
        assert_eq!(reply.seq, 1);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_a_codec_error() {
        let (mut client, mut server) = memory_pair(1024);
        client.send(&vec![0u8; 2]).await.unwrap();
        assert!(matches!(
            server.recv::<Ping>().await.unwrap_err(),
            TransportError::Codec(_)
        ));
    }
}
