//! Length-prefixed framing for greeter messages. Multiple calls are
//! multiplexed over a single TCP connection, so every frame carries a
//! `call_id` chosen by the client and echoed verbatim by the server; replies
//! may arrive in any order and the `call_id` is what correlates them.
//!
//! Frame layout (all integers big endian):
//!
//! ```text
//! +-----+------+---------+--------------------------------------+
//! | len | kind | call_id | payload                              |
//! | u32 | u8   | u64     |                                      |
//! +-----+------+---------+--------------------------------------+
//!
//! kind 0 (request): name_len u32, name bytes (UTF-8)
//! kind 1 (reply):   status_code u32, status_msg_len u32, status_msg bytes,
//!                   message_len u32, message bytes
//! ```
//!
//! `len` counts everything after itself. Frames larger than [`MAX_FRAME_SIZE`]
//! are rejected on both the read and the write path: reading enforces it to
//! bound the allocation a malformed peer can cause, writing enforces it so a
//! frame we produce is never one the peer is going to drop the connection
//! over.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{HelloReply, HelloRequest, RpcStatus};

/// Upper bound on the size of a single frame, excluding the length prefix.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const KIND_REQUEST: u8 = 0;
const KIND_REPLY: u8 = 1;

/// One greeter message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client to server.
    Request {
        call_id: u64,
        request: HelloRequest,
    },

    /// Server to client.
    Reply {
        call_id: u64,
        status: RpcStatus,
        reply: HelloReply,
    },
}

impl Frame {
    /// Size of the encoded frame body, excluding the length prefix.
    pub fn encoded_len(&self) -> usize {
        1 + 8
            + match self {
                Frame::Request { request, .. } => 4 + request.name.len(),
                Frame::Reply { status, reply, .. } => {
                    4 + 4 + status.message.len() + 4 + reply.message.len()
                }
            }
    }

    /// Serializes the frame, including the length prefix.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);

        match self {
            Frame::Request { call_id, request } => {
                body.put_u8(KIND_REQUEST);
                body.put_u64(*call_id);
                put_string(&mut body, &request.name);
            }
            Frame::Reply {
                call_id,
                status,
                reply,
            } => {
                body.put_u8(KIND_REPLY);
                body.put_u64(*call_id);
                body.put_u32(status.code);
                put_string(&mut body, &status.message);
                put_string(&mut body, &reply.message);
            }
        }

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);

        frame.freeze()
    }

    /// Parses one frame body, everything after the length prefix.
    pub fn decode(mut buf: Bytes) -> io::Result<Self> {
        if buf.remaining() < 1 + 8 {
            return Err(invalid("frame too short"));
        }

        let kind = buf.get_u8();
        let call_id = buf.get_u64();

        match kind {
            KIND_REQUEST => {
                let name = get_string(&mut buf)?;
                Ok(Frame::Request {
                    call_id,
                    request: HelloRequest { name },
                })
            }
            KIND_REPLY => {
                if buf.remaining() < 4 {
                    return Err(invalid("truncated reply frame"));
                }
                let code = buf.get_u32();
                let status_message = get_string(&mut buf)?;
                let message = get_string(&mut buf)?;
                Ok(Frame::Reply {
                    call_id,
                    status: RpcStatus {
                        code,
                        message: status_message,
                    },
                    reply: HelloReply { message },
                })
            }
            other => Err(invalid(format!("unknown frame kind {other}"))),
        }
    }

    /// Reads one complete frame. Returns `None` on a clean EOF at a frame
    /// boundary, which is how a peer hangs up between calls.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Self>>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0; 4];

        match reader.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(invalid(format!("frame of {len} bytes exceeds limit")));
        }

        let mut body = vec![0; len];
        reader.read_exact(&mut body).await?;

        Self::decode(Bytes::from(body)).map(Some)
    }

    /// Writes the frame and flushes it. A frame the peer's [`Frame::read_from`]
    /// would reject is refused here instead of being put on the wire.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let len = self.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(invalid(format!("frame of {len} bytes exceeds limit")));
        }

        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    // The `as u32` below cannot truncate for any string that fits in a frame.
    debug_assert!(value.len() <= MAX_FRAME_SIZE, "string larger than any valid frame");

    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> io::Result<String> {
    if buf.remaining() < 4 {
        return Err(invalid("truncated string length"));
    }

    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(invalid("truncated string"));
    }

    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| invalid("string is not UTF-8"))
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_frame_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame::Request {
            call_id: 7,
            request: HelloRequest {
                name: String::from("foo"),
            },
        };

        frame.write_to(&mut client).await.unwrap();
        let read = Frame::read_from(&mut server).await.unwrap().unwrap();

        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn reply_frame_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame::Reply {
            call_id: 42,
            status: RpcStatus {
                code: 3,
                message: String::from("bad name"),
            },
            reply: HelloReply {
                message: String::new(),
            },
        };

        frame.write_to(&mut server).await.unwrap();
        let read = Frame::read_from(&mut client).await.unwrap().unwrap();

        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        assert!(Frame::read_from(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_not_written() {
        let (mut client, _server) = tokio::io::duplex(64);

        let frame = Frame::Request {
            call_id: 1,
            request: HelloRequest {
                name: "x".repeat(MAX_FRAME_SIZE),
            },
        };

        let err = frame.write_to(&mut client).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn frame_at_the_size_limit_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(MAX_FRAME_SIZE + 64);

        // kind + call_id + name length make up 13 bytes of body overhead.
        let frame = Frame::Request {
            call_id: 1,
            request: HelloRequest {
                name: "x".repeat(MAX_FRAME_SIZE - 13),
            },
        };

        assert_eq!(frame.encoded_len(), MAX_FRAME_SIZE);

        frame.write_to(&mut client).await.unwrap();
        let read = Frame::read_from(&mut server).await.unwrap().unwrap();

        assert_eq!(read, frame);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let len = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let err = Frame::read_from(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(9);
        buf.put_u64(1);

        let err = Frame::decode(buf.freeze()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
