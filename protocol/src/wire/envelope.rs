use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::trace;

use super::message::{ExtraInfo, WireMessage};
use super::{WireError, WireResult};
use crate::config::{MAX_FRAME_LENGTH, MAX_TRANSFER_LENGTH, TRANSFER_CHUNK_SIZE};
use crate::receipt::ReceiptEnvelope;

/// A decoded new-session request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRequest {
    pub sigma_mkl_root: String,
    pub extra: ExtraInfo,
}

/// A decoded session acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionAck {
    pub id: u64,
    pub mode_code: u8,
    pub sigma_mkl_root: String,
    pub extra: ExtraInfo,
}

/// One PoD session's view of the secured stream.
///
/// Every method is one protocol step. Receive methods return the number
/// of bytes read off the stream alongside the decoded value.
pub struct WireSession<S> {
    framed: Framed<S, LengthDelimitedCodec>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl<S> WireSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    // -- framing ------------------------------------------------------------

    async fn send_frame(&mut self, frame: Bytes) -> WireResult<u64> {
        let len = frame.len() as u64;
        self.framed.send(frame).await?;
        self.bytes_sent += len;
        Ok(len)
    }

    async fn recv_frame(&mut self) -> WireResult<Bytes> {
        match self.framed.next().await {
            Some(Ok(frame)) => {
                self.bytes_received += frame.len() as u64;
                Ok(frame.freeze())
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(WireError::Closed),
        }
    }

    async fn send(&mut self, msg: &WireMessage) -> WireResult<u64> {
        trace!(message = msg.name(), "send");
        self.send_frame(Bytes::from(msg.encode()?)).await
    }

    async fn recv(&mut self) -> WireResult<(WireMessage, u64)> {
        let frame = self.recv_frame().await?;
        let msg = WireMessage::decode(&frame)?;
        trace!(message = msg.name(), bytes = frame.len(), "recv");
        Ok((msg, frame.len() as u64))
    }

    // -- establishment ------------------------------------------------------

    /// Buyer opens a session. `hint` must be zero for a fresh session.
    pub async fn send_new_session_request(
        &mut self,
        hint: u64,
        sigma_mkl_root: &str,
        extra: &ExtraInfo,
    ) -> WireResult<u64> {
        if hint != 0 {
            return Err(WireError::NonZeroHint(hint));
        }
        self.send(&WireMessage::SessionRequest {
            id: hint,
            sigma_mkl_root: sigma_mkl_root.to_string(),
            extra_info: extra.to_json()?,
        })
        .await
    }

    pub async fn recv_session_request(&mut self) -> WireResult<(SessionRequest, u64)> {
        match self.recv().await? {
            (
                WireMessage::SessionRequest {
                    id,
                    sigma_mkl_root,
                    extra_info,
                },
                n,
            ) => {
                if id != 0 {
                    return Err(WireError::NonZeroHint(id));
                }
                let extra = ExtraInfo::from_json(&extra_info)?;
                Ok((
                    SessionRequest {
                        sigma_mkl_root,
                        extra,
                    },
                    n,
                ))
            }
            (other, _) => Err(unexpected("SessionRequest", &other)),
        }
    }

    pub async fn send_session_ack(&mut self, ack: &SessionAck) -> WireResult<u64> {
        self.send(&WireMessage::SessionAck {
            id: ack.id,
            mode: ack.mode_code,
            sigma_mkl_root: ack.sigma_mkl_root.clone(),
            extra_info: ack.extra.to_json()?,
        })
        .await
    }

    /// Receive an ack. The side that assigned the id passes
    /// `Some((id, mode_code))` and the echo must match it exactly.
    pub async fn recv_session_ack(
        &mut self,
        expected: Option<(u64, u8)>,
    ) -> WireResult<(SessionAck, u64)> {
        let (id, mode, sigma_mkl_root, extra_info, n) = match self.recv().await? {
            (
                WireMessage::SessionAck {
                    id,
                    mode,
                    sigma_mkl_root,
                    extra_info,
                },
                n,
            ) => (id, mode, sigma_mkl_root, extra_info, n),
            (other, _) => return Err(unexpected("SessionAck", &other)),
        };
        if let Some((sent, sent_mode)) = expected {
            if id != sent {
                return Err(WireError::SessionMismatch { sent, echoed: id });
            }
            if mode != sent_mode {
                return Err(WireError::Protocol(format!(
                    "mode code echo {mode} does not match {sent_mode}"
                )));
            }
        }
        let extra = ExtraInfo::from_json(&extra_info)?;
        Ok((
            SessionAck {
                id,
                mode_code: mode,
                sigma_mkl_root,
                extra,
            },
            n,
        ))
    }

    // -- negotiation --------------------------------------------------------

    pub async fn send_nego_request(&mut self, payload: Vec<u8>) -> WireResult<u64> {
        self.send(&WireMessage::NegoRequest { payload }).await
    }

    pub async fn recv_nego_request(&mut self) -> WireResult<(Vec<u8>, u64)> {
        match self.recv().await? {
            (WireMessage::NegoRequest { payload }, n) => Ok((payload, n)),
            (other, _) => Err(unexpected("NegoRequest", &other)),
        }
    }

    /// Answer a negotiation request and reflect one back in the same frame.
    pub async fn send_nego_ack_req(&mut self, ack: Vec<u8>, request: Vec<u8>) -> WireResult<u64> {
        self.send(&WireMessage::NegoAckReq { ack, request }).await
    }

    pub async fn recv_nego_ack_req(&mut self) -> WireResult<((Vec<u8>, Vec<u8>), u64)> {
        match self.recv().await? {
            (WireMessage::NegoAckReq { ack, request }, n) => Ok(((ack, request), n)),
            (other, _) => Err(unexpected("NegoAckReq", &other)),
        }
    }

    pub async fn send_nego_ack(&mut self, payload: Vec<u8>) -> WireResult<u64> {
        self.send(&WireMessage::NegoAck { payload }).await
    }

    pub async fn recv_nego_ack(&mut self) -> WireResult<(Vec<u8>, u64)> {
        match self.recv().await? {
            (WireMessage::NegoAck { payload }, n) => Ok((payload, n)),
            (other, _) => Err(unexpected("NegoAck", &other)),
        }
    }

    // -- bulk transfer ------------------------------------------------------

    pub async fn send_tx_request(&mut self, path: &Path) -> WireResult<u64> {
        self.send_file(path, |length| WireMessage::TxRequest { length })
            .await
    }

    pub async fn recv_tx_request(&mut self, path: &Path) -> WireResult<u64> {
        self.recv_file(path, "TxRequest").await
    }

    pub async fn send_tx_response(&mut self, path: &Path) -> WireResult<u64> {
        self.send_file(path, |length| WireMessage::TxResponse { length })
            .await
    }

    pub async fn recv_tx_response(&mut self, path: &Path) -> WireResult<u64> {
        self.recv_file(path, "TxResponse").await
    }

    async fn send_file(
        &mut self,
        path: &Path,
        header: impl FnOnce(u64) -> WireMessage,
    ) -> WireResult<u64> {
        let mut file = File::open(path).await?;
        let length = file.metadata().await?.len();
        if length > MAX_TRANSFER_LENGTH {
            return Err(WireError::TooLarge(length));
        }
        self.send(&header(length)).await?;

        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut sent = 0u64;
        while sent < length {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Err(WireError::Protocol(format!(
                    "{} shrank during transfer",
                    path.display()
                )));
            }
            self.send_frame(Bytes::copy_from_slice(&buf[..n])).await?;
            sent += n as u64;
        }
        Ok(sent)
    }

    async fn recv_file(&mut self, path: &Path, expected: &'static str) -> WireResult<u64> {
        let (msg, _) = self.recv().await?;
        let length = match (&msg, expected) {
            (WireMessage::TxRequest { length }, "TxRequest")
            | (WireMessage::TxResponse { length }, "TxResponse") => *length,
            _ => return Err(unexpected(expected, &msg)),
        };
        if length > MAX_TRANSFER_LENGTH {
            return Err(WireError::TooLarge(length));
        }

        let mut file = File::create(path).await?;
        let mut received = 0u64;
        while received < length {
            let chunk = self.recv_frame().await?;
            received += chunk.len() as u64;
            if received > length {
                return Err(WireError::Protocol(format!(
                    "{expected} overran announced length {length}"
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(received)
    }

    // -- receipt ------------------------------------------------------------

    pub async fn send_tx_receipt(&mut self, envelope: &ReceiptEnvelope) -> WireResult<u64> {
        let payload =
            serde_json::to_vec(envelope).map_err(|e| WireError::Codec(e.to_string()))?;
        self.send(&WireMessage::TxReceipt { payload }).await
    }

    pub async fn recv_tx_receipt(&mut self) -> WireResult<(ReceiptEnvelope, u64)> {
        match self.recv().await? {
            (WireMessage::TxReceipt { payload }, n) => {
                let envelope = serde_json::from_slice(&payload)
                    .map_err(|e| WireError::Protocol(format!("invalid receipt envelope: {e}")))?;
                Ok((envelope, n))
            }
            (other, _) => Err(unexpected("TxReceipt", &other)),
        }
    }

    /// Flush and shut down the write half.
    pub async fn close(&mut self) -> WireResult<()> {
        SinkExt::<Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

fn unexpected(expected: &'static str, got: &WireMessage) -> WireError {
    WireError::UnexpectedMessage {
        expected,
        got: got.name(),
    }
}
