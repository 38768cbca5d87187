//! Wire framings for the `bwprobe` protocol: the TCP data frame, the five
//! UDP packet variants, and the length-prefixed JSON-RPC envelope.
//!
//! Mirrors the framing style of `iperf3-server` (4-byte big-endian length
//! prefix around a JSON control message), generalized to the richer
//! `bwprobe` dialect: a 4-byte ASCII mode header selects the data
//! connection's behavior, and UDP packets are tagged by a leading type byte.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Max accepted TCP data-frame payload.
pub const MAX_TCP_FRAME_PAYLOAD: usize = 4 * 1024 * 1024;
/// Max accepted UDP datagram.
pub const MAX_UDP_PACKET: usize = 64 * 1024;
/// Max accepted JSON-RPC message.
pub const MAX_RPC_MESSAGE: usize = 10 * 1024 * 1024;

/// Mode header selecting the behavior of a newly-opened data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Client sends data to the server.
    Data,
    /// Server sends data to the client (reverse sample).
    Recv,
    /// Legacy newline-delimited text control dialect.
    Ctrl,
    /// Length-prefixed JSON-RPC control dialect.
    Rpc,
    /// One-shot ping; server replies `PONG` and closes.
    Ping,
}

impl Mode {
    pub fn header(self) -> [u8; 4] {
        match self {
            Mode::Data => *b"DATA",
            Mode::Recv => *b"RECV",
            Mode::Ctrl => *b"CTRL",
            Mode::Rpc => *b"RPC\0",
            Mode::Ping => *b"PING",
        }
    }

    pub fn from_header(header: &[u8; 4]) -> Option<Mode> {
        match header {
            b"DATA" => Some(Mode::Data),
            b"RECV" => Some(Mode::Recv),
            b"CTRL" => Some(Mode::Ctrl),
            b"RPC\0" => Some(Mode::Rpc),
            b"PING" => Some(Mode::Ping),
            _ => None,
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Mode> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await?;
        Mode::from_header(&buf).ok_or_else(|| Error::UnknownTag(buf.to_vec()))
    }

    pub async fn write<W: AsyncWrite + Unpin>(self, w: &mut W) -> Result<()> {
        w.write_all(&self.header()).await?;
        Ok(())
    }
}

/// `"PONG"` reply bytes sent on the one-shot `PING` TCP path before closing.
pub const TCP_PONG_REPLY: &[u8; 4] = b"PONG";

/// A TCP data frame: `sample_id(4) | payload_length(4) | payload`.
#[derive(Debug, Clone)]
pub struct TcpDataFrame {
    pub sample_id: u32,
    pub payload: Bytes,
}

impl TcpDataFrame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(8 + self.payload.len());
        buf.put_u32(self.sample_id);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from an in-memory buffer (used in unit tests); returns
    /// the frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 8 {
            return Err(Error::Malformed("frame header truncated".into()));
        }
        let sample_id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let len = u32::from_be_bytes(buf[4..8].try_into().unwrap()) as usize;
        if len > MAX_TCP_FRAME_PAYLOAD {
            return Err(Error::FrameTooLarge {
                len,
                max: MAX_TCP_FRAME_PAYLOAD,
            });
        }
        if buf.len() < 8 + len {
            return Err(Error::Malformed("frame payload truncated".into()));
        }
        Ok((
            TcpDataFrame {
                sample_id,
                payload: Bytes::copy_from_slice(&buf[8..8 + len]),
            },
            8 + len,
        ))
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        if self.payload.len() > MAX_TCP_FRAME_PAYLOAD {
            return Err(Error::FrameTooLarge {
                len: self.payload.len(),
                max: MAX_TCP_FRAME_PAYLOAD,
            });
        }
        w.write_all(&self.encode()).await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut header = [0u8; 8];
        r.read_exact(&mut header).await?;
        let sample_id = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
        if len > MAX_TCP_FRAME_PAYLOAD {
            return Err(Error::FrameTooLarge {
                len,
                max: MAX_TCP_FRAME_PAYLOAD,
            });
        }
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload).await?;
        Ok(TcpDataFrame {
            sample_id,
            payload: Bytes::from(payload),
        })
    }
}

/// Validate a session id is a 36-char hyphenated or 32-char hex UUID.
pub fn validate_session_id(s: &str) -> Result<()> {
    let ok = match s.len() {
        36 => uuid::Uuid::parse_str(s).is_ok(),
        32 => s.bytes().all(|b| b.is_ascii_hexdigit()),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidSessionId(s.to_string()))
    }
}

/// Write the 2-byte length-prefixed session id that follows `DATA`/`RECV`
/// mode headers when the control channel used RPC framing.
pub async fn write_session_id<W: AsyncWrite + Unpin>(w: &mut W, session_id: &str) -> Result<()> {
    validate_session_id(session_id)?;
    let bytes = session_id.as_bytes();
    w.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
    w.write_all(bytes).await?;
    Ok(())
}

pub async fn read_session_id<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    if len == 0 || len > 255 {
        return Err(Error::Malformed(format!("bad session id length {len}")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    let s = String::from_utf8(buf).map_err(|e| Error::Malformed(e.to_string()))?;
    validate_session_id(&s)?;
    Ok(s)
}

/// UDP packet type tag (first byte of every datagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpType {
    Data = 1,
    Ping = 2,
    Pong = 3,
    Done = 4,
    Stats = 5,
    DataSession = 6,
}

impl UdpType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(UdpType::Data),
            2 => Some(UdpType::Ping),
            3 => Some(UdpType::Pong),
            4 => Some(UdpType::Done),
            5 => Some(UdpType::Stats),
            6 => Some(UdpType::DataSession),
            _ => None,
        }
    }
}

/// The five UDP packet shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum UdpPacket {
    Data {
        sample_id: u32,
        seq: u64,
        payload: Bytes,
    },
    DataSession {
        session_id: String,
        sample_id: u32,
        seq: u64,
        payload: Bytes,
    },
    Ping { nanos: u64 },
    Pong { nanos: u64 },
    /// Reverse-UDP end-of-sample marker; the server sends this 3x with 10ms
    /// spacing.
    Done { sample_id: u32 },
    Stats { recv: u64, lost: u64, bytes: u64 },
}

impl UdpPacket {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            UdpPacket::Data {
                sample_id,
                seq,
                payload,
            } => {
                buf.put_u8(UdpType::Data as u8);
                buf.put_u32(*sample_id);
                buf.put_u64(*seq);
                buf.extend_from_slice(payload);
            }
            UdpPacket::DataSession {
                session_id,
                sample_id,
                seq,
                payload,
            } => {
                let sid = session_id.as_bytes();
                buf.put_u8(UdpType::DataSession as u8);
                buf.put_u8(sid.len() as u8);
                buf.extend_from_slice(sid);
                buf.put_u32(*sample_id);
                buf.put_u64(*seq);
                buf.extend_from_slice(payload);
            }
            UdpPacket::Ping { nanos } => {
                buf.put_u8(UdpType::Ping as u8);
                buf.put_u64(*nanos);
            }
            UdpPacket::Pong { nanos } => {
                buf.put_u8(UdpType::Pong as u8);
                buf.put_u64(*nanos);
            }
            UdpPacket::Done { sample_id } => {
                buf.put_u8(UdpType::Done as u8);
                buf.put_u32(*sample_id);
            }
            UdpPacket::Stats { recv, lost, bytes } => {
                buf.put_u8(UdpType::Stats as u8);
                buf.put_u64(*recv);
                buf.put_u64(*lost);
                buf.put_u64(*bytes);
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() > MAX_UDP_PACKET {
            return Err(Error::FrameTooLarge {
                len: buf.len(),
                max: MAX_UDP_PACKET,
            });
        }
        let mut cur = Bytes::copy_from_slice(buf);
        if cur.is_empty() {
            return Err(Error::Malformed("empty udp packet".into()));
        }
        let ty = UdpType::from_byte(cur.get_u8()).ok_or_else(|| Error::UnknownTag(vec![buf[0]]))?;
        match ty {
            UdpType::Data => {
                if cur.remaining() < 12 {
                    return Err(Error::Malformed("DATA packet truncated".into()));
                }
                let sample_id = cur.get_u32();
                let seq = cur.get_u64();
                Ok(UdpPacket::Data {
                    sample_id,
                    seq,
                    payload: cur,
                })
            }
            UdpType::DataSession => {
                if cur.remaining() < 1 {
                    return Err(Error::Malformed("DATA_SESSION truncated".into()));
                }
                let sid_len = cur.get_u8() as usize;
                if sid_len == 0 || sid_len > 255 || cur.remaining() < sid_len + 12 {
                    return Err(Error::Malformed("DATA_SESSION truncated".into()));
                }
                let sid_bytes = cur.split_to(sid_len);
                let session_id = String::from_utf8(sid_bytes.to_vec())
                    .map_err(|e| Error::Malformed(e.to_string()))?;
                let sample_id = cur.get_u32();
                let seq = cur.get_u64();
                Ok(UdpPacket::DataSession {
                    session_id,
                    sample_id,
                    seq,
                    payload: cur,
                })
            }
            UdpType::Ping => {
                if cur.remaining() < 8 {
                    return Err(Error::Malformed("PING truncated".into()));
                }
                Ok(UdpPacket::Ping { nanos: cur.get_u64() })
            }
            UdpType::Pong => {
                if cur.remaining() < 8 {
                    return Err(Error::Malformed("PONG truncated".into()));
                }
                Ok(UdpPacket::Pong { nanos: cur.get_u64() })
            }
            UdpType::Done => {
                if cur.remaining() < 4 {
                    return Err(Error::Malformed("DONE truncated".into()));
                }
                Ok(UdpPacket::Done {
                    sample_id: cur.get_u32(),
                })
            }
            UdpType::Stats => {
                if cur.remaining() < 24 {
                    return Err(Error::Malformed("STATS truncated".into()));
                }
                Ok(UdpPacket::Stats {
                    recv: cur.get_u64(),
                    lost: cur.get_u64(),
                    bytes: cur.get_u64(),
                })
            }
        }
    }
}

/// Write a 4-byte big-endian length prefix followed by UTF-8 JSON.
pub async fn write_rpc_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    value: &serde_json::Value,
) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    if data.len() > MAX_RPC_MESSAGE {
        return Err(Error::FrameTooLarge {
            len: data.len(),
            max: MAX_RPC_MESSAGE,
        });
    }
    w.write_all(&(data.len() as u32).to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_rpc_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<serde_json::Value> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_RPC_MESSAGE {
        return Err(Error::FrameTooLarge {
            len,
            max: MAX_RPC_MESSAGE,
        });
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_data_frame_round_trips() {
        let frame = TcpDataFrame {
            sample_id: 42,
            payload: Bytes::from_static(b"hello world"),
        };
        let encoded = frame.encode();
        let (decoded, consumed) = TcpDataFrame::decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.sample_id, 42);
        assert_eq!(decoded.payload, frame.payload);
    }

    #[test]
    fn oversize_tcp_frame_rejected_on_decode() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32((MAX_TCP_FRAME_PAYLOAD + 1) as u32);
        let err = TcpDataFrame::decode(&buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[test]
    fn udp_data_session_round_trips() {
        let packet = UdpPacket::DataSession {
            session_id: uuid::Uuid::nil().to_string(),
            sample_id: 7,
            seq: 12345,
            payload: Bytes::from_static(b"payload-bytes"),
        };
        let encoded = packet.encode();
        let decoded = UdpPacket::decode(&encoded).unwrap();
        match decoded {
            UdpPacket::DataSession {
                session_id,
                sample_id,
                seq,
                payload,
            } => {
                assert_eq!(session_id, uuid::Uuid::nil().to_string());
                assert_eq!(sample_id, 7);
                assert_eq!(seq, 12345);
                assert_eq!(payload, Bytes::from_static(b"payload-bytes"));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn mode_header_round_trips() {
        for mode in [Mode::Data, Mode::Recv, Mode::Ctrl, Mode::Rpc, Mode::Ping] {
            assert_eq!(Mode::from_header(&mode.header()), Some(mode));
        }
    }

    #[test]
    fn session_id_validation() {
        assert!(validate_session_id(&uuid::Uuid::new_v4().to_string()).is_ok());
        assert!(validate_session_id(&uuid::Uuid::new_v4().simple().to_string()).is_ok());
        assert!(validate_session_id("not-a-uuid").is_err());
    }

    #[tokio::test]
    async fn rpc_message_round_trips_over_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let value = serde_json::json!({"jsonrpc": "2.0", "method": "ping", "id": 1});
        write_rpc_message(&mut client, &value).await.unwrap();
        let received = read_rpc_message(&mut server).await.unwrap();
        assert_eq!(received, value);
    }
}
