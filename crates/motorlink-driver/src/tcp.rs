//! Raw TCP link to a motor controller speaking the line protocol.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use motorlink_core::{DriverError, Frame, ProtocolDriver};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::codec::{LineCodec, MotorCodec, Request};

/// Longest accepted response line.
const MAX_LINE: usize = 4096;

/// TCP driver.
///
/// The read and write halves are guarded separately so the response
/// listener can wait for frames while writers send.
#[derive(Default)]
pub struct TcpDriver {
    reader: Mutex<Option<FramedRead<OwnedReadHalf, LinesCodec>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpDriver {
    /// Create an unconnected driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProtocolDriver for TcpDriver {
    async fn connect(&self, address: &str, port: u16) -> Result<(), DriverError> {
        let stream = TcpStream::connect((address, port))
            .await
            .map_err(|e| DriverError::Unreachable {
                address: format!("{address}:{port}"),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let (read, write) = stream.into_split();
        *self.reader.lock().await = Some(FramedRead::new(
            read,
            LinesCodec::new_with_max_length(MAX_LINE),
        ));
        *self.writer.lock().await = Some(write);
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<(), DriverError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(DriverError::NotConnected)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<Frame, DriverError> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(DriverError::NotConnected)?;
        match reader.next().await {
            Some(Ok(line)) => Ok(Frame(Bytes::from(line))),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(DriverError::InvalidFrame(
                format!("line longer than {MAX_LINE} bytes"),
            )),
            Some(Err(LinesCodecError::Io(e))) => Err(DriverError::Io(e)),
            None => Err(DriverError::Closed),
        }
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }

    async fn bring_up(&self, adapter: &str) -> Result<(), DriverError> {
        let frame = LineCodec
            .encode(&Request::BringUp(adapter))
            .map_err(|e| DriverError::BringUp(e.to_string()))?;
        self.send(frame).await
    }
}
