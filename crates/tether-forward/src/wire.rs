//! Command-channel wire format.
//!
//! Frames are a 1-byte opcode followed by opcode-specific big-endian 32-bit
//! integers. There is no length prefix: the receiver knows how many bytes
//! each opcode carries and simply waits until a full frame has arrived.
//!
//! `OPEN_CHANNEL_ACK` is the odd one out: it is never sent on the command
//! channel. The host writes it into the freshly connected rendezvous socket
//! itself (the data plane), so the device side can demultiplex the ack from
//! the socket it just accepted. See [`encode_ack`] / [`parse_ack`].

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{ForwardError, Result, TunnelId};

pub const CMD_UNKNOWN: u8 = 1;
pub const CMD_OPEN_CHANNEL: u8 = 2;
pub const CMD_OPEN_CHANNEL_ACK: u8 = 3;
pub const CMD_OPEN_CHANNEL_FAIL: u8 = 4;
pub const CMD_HELLO: u8 = 5;

/// Length of the ack preamble the host writes into the data plane.
pub const ACK_LEN: usize = 5;

/// A parsed command-channel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Reply to an opcode the peer did not understand, echoing it.
    Unknown { opcode: u8 },
    /// Device asks the host to complete tunnel `tunnel_id` for a connection
    /// accepted on device port `source_port`.
    OpenChannel { source_port: u16, tunnel_id: TunnelId },
    /// Decode-only: an `OPEN_CHANNEL` whose 32-bit port field does not
    /// fit a TCP port. The whole 9-byte frame is consumed; the tunnel can
    /// never be completed, so the standard response is an
    /// [`Frame::OpenChannelFail`] reply.
    OpenChannelInvalid { source_port: u32, tunnel_id: TunnelId },
    /// Host could not complete tunnel `tunnel_id`; the device must drop it.
    OpenChannelFail { tunnel_id: TunnelId },
    /// Sent by the device immediately after the command connection is
    /// accepted.
    Hello,
    /// Decode-only: an opcode this side does not recognize. Exactly the
    /// opcode byte is consumed; the standard response is an
    /// [`Frame::Unknown`] reply.
    Unrecognized { opcode: u8 },
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        match *self {
            Frame::Unknown { opcode } => {
                buf.push(CMD_UNKNOWN);
                buf.push(opcode);
            }
            Frame::OpenChannel {
                source_port,
                tunnel_id,
            } => {
                buf.push(CMD_OPEN_CHANNEL);
                buf.extend_from_slice(&u32::from(source_port).to_be_bytes());
                buf.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::OpenChannelInvalid {
                source_port,
                tunnel_id,
            } => {
                buf.push(CMD_OPEN_CHANNEL);
                buf.extend_from_slice(&source_port.to_be_bytes());
                buf.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::OpenChannelFail { tunnel_id } => {
                buf.push(CMD_OPEN_CHANNEL_FAIL);
                buf.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::Hello => buf.push(CMD_HELLO),
            Frame::Unrecognized { opcode } => buf.push(opcode),
        }
        buf
    }
}

/// Read one frame, waiting for as many bytes as its opcode requires.
///
/// Errors are transport-level only, and fatal to the command channel: EOF
/// on the opcode boundary maps to
/// [`ForwardError::CommandConnectionClosed`], EOF in the middle of a frame
/// surfaces as a plain I/O error. Malformed-but-framed input decodes into
/// the decode-only `Frame` variants so the caller can answer it without
/// losing the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let opcode = match reader.read_u8().await {
        Ok(opcode) => opcode,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ForwardError::CommandConnectionClosed)
        }
        Err(err) => return Err(err.into()),
    };

    match opcode {
        CMD_UNKNOWN => {
            let offending = reader.read_u8().await?;
            Ok(Frame::Unknown { opcode: offending })
        }
        CMD_OPEN_CHANNEL => {
            let mut payload = [0u8; 8];
            reader.read_exact(&mut payload).await?;
            let source_port = u32::from_be_bytes(payload[..4].try_into().expect("4 bytes"));
            let tunnel_id = u32::from_be_bytes(payload[4..].try_into().expect("4 bytes"));
            match u16::try_from(source_port) {
                Ok(source_port) => Ok(Frame::OpenChannel {
                    source_port,
                    tunnel_id,
                }),
                Err(_) => Ok(Frame::OpenChannelInvalid {
                    source_port,
                    tunnel_id,
                }),
            }
        }
        CMD_OPEN_CHANNEL_FAIL => {
            let tunnel_id = reader.read_u32().await?;
            Ok(Frame::OpenChannelFail { tunnel_id })
        }
        CMD_HELLO => Ok(Frame::Hello),
        opcode => Ok(Frame::Unrecognized { opcode }),
    }
}

/// Encode the ack preamble the host writes into the rendezvous leg before
/// spooling starts.
pub fn encode_ack(tunnel_id: TunnelId) -> [u8; ACK_LEN] {
    let mut buf = [0u8; ACK_LEN];
    buf[0] = CMD_OPEN_CHANNEL_ACK;
    buf[1..].copy_from_slice(&tunnel_id.to_be_bytes());
    buf
}

/// Parse the ack preamble received on a pending channel.
///
/// Anything other than `OPEN_CHANNEL_ACK` in the opcode slot is a protocol
/// error; the caller closes the pending channel.
pub fn parse_ack(buf: &[u8; ACK_LEN]) -> Result<TunnelId> {
    if buf[0] != CMD_OPEN_CHANNEL_ACK {
        return Err(ForwardError::Protocol(format!(
            "expected OPEN_CHANNEL_ACK on pending channel, got opcode {}",
            buf[0]
        )));
    }
    Ok(u32::from_be_bytes(buf[1..].try_into().expect("4 bytes")))
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[test]
    fn frame_encodings_have_documented_lengths() {
        assert_eq!(Frame::Unknown { opcode: 0x7f }.encode(), vec![1, 0x7f]);
        assert_eq!(
            Frame::OpenChannel {
                source_port: 8000,
                tunnel_id: 7,
            }
            .encode(),
            vec![2, 0, 0, 0x1f, 0x40, 0, 0, 0, 7]
        );
        assert_eq!(
            Frame::OpenChannelFail { tunnel_id: 3 }.encode(),
            vec![4, 0, 0, 0, 3]
        );
        assert_eq!(Frame::Hello.encode(), vec![5]);
    }

    #[tokio::test]
    async fn decodes_back_to_back_frames() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(
            &Frame::OpenChannel {
                source_port: 8000,
                tunnel_id: 42,
            }
            .encode(),
        );
        bytes.extend_from_slice(&Frame::OpenChannelFail { tunnel_id: 42 }.encode());
        bytes.extend_from_slice(&Frame::Hello.encode());

        let mut reader = bytes.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::OpenChannel {
                source_port: 8000,
                tunnel_id: 42,
            }
        );
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::OpenChannelFail { tunnel_id: 42 }
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Hello);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(ForwardError::CommandConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn waits_for_split_frame_delivery() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let frame = Frame::OpenChannel {
            source_port: 9000,
            tunnel_id: 0xdead_beef,
        };
        let bytes = frame.encode();

        let writer = tokio::spawn(async move {
            // Deliver the 9-byte frame one byte at a time.
            for b in bytes {
                tx.write_all(&[b]).await.unwrap();
                tokio::task::yield_now().await;
            }
            tx
        });

        assert_eq!(read_frame(&mut rx).await.unwrap(), frame);
        drop(writer.await.unwrap());
        assert!(matches!(
            read_frame(&mut rx).await,
            Err(ForwardError::CommandConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn unrecognized_opcode_consumes_one_byte() {
        let mut bytes = Frame::Unrecognized { opcode: 0x2a }.encode();
        bytes.extend_from_slice(&Frame::Hello.encode());
        let mut reader = bytes.as_slice();
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Unrecognized { opcode: 0x2a }
        );
        // The next byte is interpreted as a fresh opcode.
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Hello);
    }

    #[tokio::test]
    async fn out_of_range_port_does_not_cost_the_stream() {
        let invalid = Frame::OpenChannelInvalid {
            source_port: 0x0001_0000,
            tunnel_id: 1,
        };
        let mut bytes = invalid.encode();
        bytes.extend_from_slice(&Frame::Hello.encode());
        let mut reader = bytes.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap(), invalid);
        // The full 9-byte frame was consumed; framing stays intact.
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Hello);
    }

    #[test]
    fn ack_round_trip_and_rejection() {
        let buf = encode_ack(0x0102_0304);
        assert_eq!(buf, [CMD_OPEN_CHANNEL_ACK, 1, 2, 3, 4]);
        assert_eq!(parse_ack(&buf).unwrap(), 0x0102_0304);

        let mut bad = buf;
        bad[0] = CMD_OPEN_CHANNEL;
        assert!(parse_ack(&bad).is_err());
    }
}
