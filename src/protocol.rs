//! Just enough of the game protocol to answer clients while a backend is down.
//!
//! Packets are framed as `VarInt length | VarInt id | body`. Only the
//! handshake, status and login-start packets are understood; everything
//! after a successful probe is forwarded as raw bytes.

use crate::error::ProtocolError;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Upper bound for any packet we are willing to buffer
pub const MAX_PACKET_LEN: i32 = 2 * 1024 * 1024; // 2 MiB

/// First byte of the pre-netty server list ping
pub const LEGACY_PING: u8 = 0xFE;

/// Protocol version sent when probing a backend of unknown version
pub const PROBE_PROTOCOL_VERSION: i32 = -1;

const MAX_NAME_LEN: usize = 16;
const MAX_ADDRESS_LEN: usize = 255;
const MAX_STRING_LEN: usize = 32767 * 3;

pub mod packet_id {
    pub const HANDSHAKE: i32 = 0x00;
    pub const STATUS_REQUEST: i32 = 0x00;
    pub const STATUS_RESPONSE: i32 = 0x00;
    pub const PING: i32 = 0x01;
    pub const PONG: i32 = 0x01;
    pub const LOGIN_START: i32 = 0x00;
    pub const LOGIN_DISCONNECT: i32 = 0x00;
}

// ============================================================================
// VarInt and framing
// ============================================================================

pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut value = value as u32;
    loop {
        if value & !0x7F == 0 {
            buf.push(value as u8);
            return;
        }
        buf.push(((value & 0x7F) | 0x80) as u8);
        value >>= 7;
    }
}

pub fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_varint(buf, value.len() as i32);
    buf.extend_from_slice(value.as_bytes());
}

/// Continue decoding a VarInt whose first byte was already consumed
async fn read_varint_after<R: AsyncRead + Unpin>(
    first: u8,
    reader: &mut R,
) -> Result<i32, ProtocolError> {
    let mut result = (first & 0x7F) as u32;
    let mut byte = first;
    let mut shift = 7;
    while byte & 0x80 != 0 {
        if shift >= 35 {
            return Err(ProtocolError::VarIntTooLong);
        }
        byte = reader.read_u8().await?;
        result |= ((byte & 0x7F) as u32) << shift;
        shift += 7;
    }
    Ok(result as i32)
}

pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32, ProtocolError> {
    let first = reader.read_u8().await?;
    read_varint_after(first, reader).await
}

/// A decoded packet: id plus the remaining body bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub body: Vec<u8>,
}

async fn read_packet_with_length<R: AsyncRead + Unpin>(
    length: i32,
    reader: &mut R,
) -> Result<Packet, ProtocolError> {
    if length <= 0 || length > MAX_PACKET_LEN {
        return Err(ProtocolError::BadLength(length));
    }
    let mut data = vec![0u8; length as usize];
    reader.read_exact(&mut data).await?;

    let mut cursor = Reader::new(&data);
    let id = cursor.varint()?;
    let body = cursor.rest().to_vec();
    Ok(Packet { id, body })
}

pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, ProtocolError> {
    let length = read_varint(reader).await?;
    read_packet_with_length(length, reader).await
}

/// Frame a packet for the wire
pub fn encode_packet(id: i32, body: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(body.len() + 5);
    write_varint(&mut inner, id);
    inner.extend_from_slice(body);

    let mut framed = Vec::with_capacity(inner.len() + 5);
    write_varint(&mut framed, inner.len() as i32);
    framed.extend_from_slice(&inner);
    framed
}

pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: i32,
    body: &[u8],
) -> Result<(), ProtocolError> {
    writer.write_all(&encode_packet(id, body)).await?;
    writer.flush().await?;
    Ok(())
}

/// Cursor over a packet body
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn varint(&mut self) -> Result<i32, ProtocolError> {
        let mut result: u32 = 0;
        for i in 0..5 {
            let byte = self.u8()?;
            result |= ((byte & 0x7F) as u32) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result as i32);
            }
        }
        Err(ProtocolError::VarIntTooLong)
    }

    pub fn string(&mut self, max_len: usize) -> Result<String, ProtocolError> {
        let len = self.varint()?;
        if len < 0 || len as usize > max_len * 4 {
            return Err(ProtocolError::InvalidString);
        }
        let bytes = self.take(len as usize)?;
        let value = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)?;
        if value.chars().count() > max_len {
            return Err(ProtocolError::InvalidString);
        }
        Ok(value.to_string())
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn i64(&mut self) -> Result<i64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    pub fn uuid(&mut self) -> Result<Uuid, ProtocolError> {
        let bytes = self.take(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(raw))
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// What the client wants after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    /// Login redirected from another server; followed by a normal login start
    Transfer,
    Unknown(i32),
}

impl From<i32> for NextState {
    fn from(value: i32) -> Self {
        match value {
            1 => NextState::Status,
            2 => NextState::Login,
            3 => NextState::Transfer,
            other => NextState::Unknown(other),
        }
    }
}

impl NextState {
    pub fn as_i32(self) -> i32 {
        match self {
            NextState::Status => 1,
            NextState::Login => 2,
            NextState::Transfer => 3,
            NextState::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

impl Handshake {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(body);
        Ok(Self {
            protocol_version: reader.varint()?,
            server_address: reader.string(MAX_ADDRESS_LEN)?,
            server_port: reader.u16()?,
            next_state: NextState::from(reader.varint()?),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_varint(&mut body, self.protocol_version);
        write_string(&mut body, &self.server_address);
        body.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(&mut body, self.next_state.as_i32());
        encode_packet(packet_id::HANDSHAKE, &body)
    }
}

/// Who is trying to log in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub name: String,
    pub id: Option<Uuid>,
}

impl PlayerIdentity {
    /// Decode a login-start body.
    ///
    /// The name is mandatory. The id is read when the trailing bytes have one
    /// of the shapes used by recent protocol versions (bare UUID, or a
    /// presence flag followed by a UUID); anything else leaves it unset.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(body);
        let name = reader.string(MAX_NAME_LEN)?;
        let id = match reader.remaining() {
            16 => Some(reader.uuid()?),
            17 if reader.u8()? == 1 => Some(reader.uuid()?),
            _ => None,
        };
        Ok(Self { name, id })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_string(&mut body, &self.name);
        if let Some(id) = self.id {
            body.extend_from_slice(id.as_bytes());
        }
        encode_packet(packet_id::LOGIN_START, &body)
    }
}

/// Classification of a freshly accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIntent {
    /// Server-list ping; status request and ping follow
    StatusQuery { protocol_version: i32 },
    /// Join attempt; the login-start packet has been consumed
    LoginAttempt {
        protocol_version: i32,
        player: PlayerIdentity,
    },
    /// Legacy ping or a next-state we do not know how to answer
    RawStream,
}

/// Read the handshake (and for logins the login-start packet) from a client
pub async fn read_intent<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ClientIntent, ProtocolError> {
    let first = reader.read_u8().await?;
    if first == LEGACY_PING {
        return Ok(ClientIntent::RawStream);
    }

    let length = read_varint_after(first, reader).await?;
    let packet = read_packet_with_length(length, reader).await?;
    if packet.id != packet_id::HANDSHAKE {
        return Err(ProtocolError::UnexpectedPacket(packet.id));
    }
    let handshake = Handshake::decode(&packet.body)?;

    match handshake.next_state {
        NextState::Status => Ok(ClientIntent::StatusQuery {
            protocol_version: handshake.protocol_version,
        }),
        NextState::Login | NextState::Transfer => {
            let login = read_packet(reader).await?;
            if login.id != packet_id::LOGIN_START {
                return Err(ProtocolError::UnexpectedPacket(login.id));
            }
            Ok(ClientIntent::LoginAttempt {
                protocol_version: handshake.protocol_version,
                player: PlayerIdentity::decode(&login.body)?,
            })
        }
        NextState::Unknown(_) => Ok(ClientIntent::RawStream),
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Status response shown in the client's server list
pub fn status_response(protocol_version: i32, version_name: &str, description: &str) -> Vec<u8> {
    let payload = json!({
        "version": { "name": version_name, "protocol": protocol_version },
        "players": { "max": 0, "online": 0 },
        "description": { "text": description },
    });
    let mut body = Vec::new();
    write_string(&mut body, &payload.to_string());
    encode_packet(packet_id::STATUS_RESPONSE, &body)
}

pub fn pong(payload: i64) -> Vec<u8> {
    encode_packet(packet_id::PONG, &payload.to_be_bytes())
}

/// Disconnect during login with a plain text reason
pub fn login_disconnect(reason: &str) -> Vec<u8> {
    let component = json!({ "text": reason });
    let mut body = Vec::new();
    write_string(&mut body, &component.to_string());
    encode_packet(packet_id::LOGIN_DISCONNECT, &body)
}

// ============================================================================
// Backend probe
// ============================================================================

/// What a live backend reported in its status response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub version: Option<String>,
    pub online_players: Option<u64>,
    pub max_players: Option<u64>,
}

impl BackendStatus {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Ok(Self {
            version: value["version"]["name"].as_str().map(str::to_string),
            online_players: value["players"]["online"].as_u64(),
            max_players: value["players"]["max"].as_u64(),
        })
    }
}

/// Perform a status request against a backend.
///
/// Succeeds only if the backend answers the handshake and status request
/// with a decodable status response within `timeout`.
pub async fn ping_status(addr: &str, timeout: Duration) -> Result<BackendStatus, ProtocolError> {
    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr).await?;

        let (host, port) = split_host_port(addr);
        let handshake = Handshake {
            protocol_version: PROBE_PROTOCOL_VERSION,
            server_address: host.to_string(),
            server_port: port,
            next_state: NextState::Status,
        };
        stream.write_all(&handshake.encode()).await?;
        write_packet(&mut stream, packet_id::STATUS_REQUEST, &[]).await?;

        let response = read_packet(&mut stream).await?;
        if response.id != packet_id::STATUS_RESPONSE {
            return Err(ProtocolError::UnexpectedPacket(response.id));
        }
        let json = Reader::new(&response.body).string(MAX_STRING_LEN)?;
        BackendStatus::from_json(&json)
    })
    .await?
}

fn split_host_port(addr: &str) -> (&str, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host.trim_matches(|c| c == '[' || c == ']'), port.parse().unwrap_or(0)),
        None => (addr, 0),
    }
}
