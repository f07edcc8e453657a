use bytes::Bytes;
use emuplay_proto::{codec::encode_message_from, messages::Message};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, trace};

use crate::{
    error::NetplayError,
    framing::{PacketOwned, TcpFramer},
};

/// Sender used by upper layers to write to one connection.
/// The payload is already framed and ready to write.
pub(crate) type OutboundTx = mpsc::Sender<Bytes>;

const READ_CHUNK: usize = 4096;

/// Spawn a writer task that drains `rx` into `write`.
///
/// Exits when every sender is dropped or a write fails, then shuts the
/// write half down.
pub(crate) fn spawn_writer<W>(mut write: W, mut rx: mpsc::Receiver<Bytes>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            trace!(len = frame.len(), "write frame");
            if let Err(e) = write.write_all(&frame).await {
                debug!(error = %e, "write failed");
                break;
            }
        }
        let _ = write.shutdown().await;
    })
}

pub(crate) fn frame<T: Message>(peer_id: u32, msg: &T) -> Result<Bytes, NetplayError> {
    Ok(Bytes::from(encode_message_from(peer_id, msg)?))
}

/// Read once and decode every complete packet. `None` on EOF.
pub(crate) async fn read_packets<R>(
    read: &mut R,
    framer: &mut TcpFramer,
) -> Result<Option<Vec<PacketOwned>>, NetplayError>
where
    R: AsyncRead + Unpin,
{
    framer.buf_mut().reserve(READ_CHUNK);
    let n = read.read_buf(framer.buf_mut()).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(framer.drain_packets()?))
}
