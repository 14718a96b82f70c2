//! Byte-stream transport for one job-server connection.
//!
//! The stream is split into a [`TransportWriter`], shared by every caller and
//! serialized with an async lock, and a [`TransportReader`], owned by the
//! connection's dispatch loop.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard, OnceCell};

use crate::error::{GearError, Result};
use crate::protocol::codec::{self, HEADER_LEN};
use crate::protocol::Packet;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// Split a connected stream into its writer and reader halves.
pub fn split<S>(stream: S, max_frame_size: usize) -> (TransportWriter, TransportReader)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = TransportWriter {
        inner: Mutex::new(Some(Box::new(write_half))),
        closed: OnceCell::new(),
    };
    let reader = TransportReader {
        inner: Box::new(read_half),
        max_frame_size,
    };
    (writer, reader)
}

pub struct TransportWriter {
    inner: Mutex<Option<BoxedWrite>>,
    closed: OnceCell<Result<()>>,
}

impl TransportWriter {
    /// Acquire the write lock.
    ///
    /// Callers that must pair bookkeeping with wire order (for example
    /// queueing a reply slot) do it while holding the returned guard.
    pub async fn lock(&self) -> WriteGuard<'_> {
        WriteGuard {
            inner: self.inner.lock().await,
        }
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        self.lock().await.send(packet).await
    }

    /// Shut down the write half. Later calls return the first call's result.
    pub async fn close(&self) -> Result<()> {
        self.closed
            .get_or_init(|| async {
                let mut inner = self.inner.lock().await;
                match inner.take() {
                    Some(mut stream) => stream.shutdown().await.map_err(GearError::from),
                    None => Ok(()),
                }
            })
            .await
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.initialized()
    }
}

pub struct WriteGuard<'a> {
    inner: MutexGuard<'a, Option<BoxedWrite>>,
}

impl WriteGuard<'_> {
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let frame = codec::encode(packet)?;
        self.send_frame(&frame).await
    }

    /// Write an already encoded frame.
    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        let stream = self.inner.as_mut().ok_or(GearError::ConnectionClosed)?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }
}

pub struct TransportReader {
    inner: BoxedRead,
    max_frame_size: usize,
}

impl TransportReader {
    /// Read exactly one frame: the fixed header, then the declared body.
    pub async fn read_next(&mut self) -> Result<Packet> {
        let mut header_bytes = [0u8; HEADER_LEN];
        self.inner
            .read_exact(&mut header_bytes)
            .await
            .map_err(map_read_error)?;
        let header = codec::decode_header(&header_bytes, self.max_frame_size)?;

        let mut body = vec![0u8; header.body_len];
        self.inner.read_exact(&mut body).await.map_err(map_read_error)?;
        codec::decode_body(&header, &body)
    }
}

fn map_read_error(err: std::io::Error) -> GearError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        GearError::ConnectionLost("connection closed by job server".to_string())
    } else {
        GearError::from(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    #[tokio::test]
    async fn frames_survive_the_stream() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let (writer, _reader) = split(client_side, 1024);
        let (_server_writer, mut server_reader) = split(server_side, 1024);

        let packet = Packet::request(PacketType::EchoReq, vec![b"ping".to_vec()]).unwrap();
        writer.send(&packet).await.unwrap();

        let received = server_reader.read_next().await.unwrap();
        assert_eq!(received, packet);
    }

    #[tokio::test]
    async fn peer_hangup_is_connection_lost() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let (_writer, mut reader) = split(client_side, 1024);
        drop(server_side);

        assert!(matches!(
            reader.read_next().await,
            Err(GearError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_writes() {
        let (client_side, _server_side) = tokio::io::duplex(64);
        let (writer, _reader) = split(client_side, 1024);

        assert!(writer.close().await.is_ok());
        assert!(writer.close().await.is_ok());
        assert!(writer.is_closed());

        let packet = Packet::request(PacketType::EchoReq, vec![b"late".to_vec()]).unwrap();
        assert!(matches!(
            writer.send(&packet).await,
            Err(GearError::ConnectionClosed)
        ));
    }
}
