//! The slice of the game's wire protocol needed to answer "is it up?".
//!
//! Status packets are framed as `VarInt(len) ‖ VarInt(packet id) ‖ data`.
//! Remote-console packets use their own little-endian framing, see
//! [`RconPacket`].

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::config::StatusProbeConfig;

pub const MAX_VARINT_LEN: usize = 5;
pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;
/// A framed status request: length 1, packet id 0x00, no data.
pub const STATUS_REQUEST: [u8; 2] = [0x01, 0x00];
const NEXT_STATE_STATUS: i32 = 1;
const MAX_STATUS_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarIntError {
    #[error("VarInt too large")]
    TooLarge,
    #[error("VarInt truncated")]
    Truncated,
}

pub fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            buf.push(v as u8);
            return;
        }
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
}

/// Decodes a VarInt from the front of `bytes`, returning the value and the
/// number of bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(i32, usize), VarIntError> {
    let mut value = 0u32;
    for (i, b) in bytes.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(VarIntError::TooLarge);
        }
        value |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value as i32, i + 1));
        }
    }
    if bytes.len() >= MAX_VARINT_LEN {
        Err(VarIntError::TooLarge)
    } else {
        Err(VarIntError::Truncated)
    }
}

pub async fn read_varint<R: AsyncRead + Unpin>(r: &mut R) -> Result<i32, ProbeError> {
    let mut value = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let b = r.read_u8().await?;
        value |= u32::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value as i32);
        }
    }
    Err(VarIntError::TooLarge.into())
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Prefixes `packet_id ‖ data` with its VarInt length.
pub fn frame_packet(packet_id: i32, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + MAX_VARINT_LEN);
    write_varint(&mut body, packet_id);
    body.extend_from_slice(data);

    let mut out = Vec::with_capacity(body.len() + MAX_VARINT_LEN);
    write_varint(&mut out, body.len() as i32);
    out.extend_from_slice(&body);
    out
}

/// Handshake announcing a status query for `host:port`.
pub fn handshake_packet(host: &str, port: u16, protocol_version: i32) -> Vec<u8> {
    let mut data = Vec::with_capacity(host.len() + 16);
    write_varint(&mut data, protocol_version);
    write_string(&mut data, host);
    data.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut data, NEXT_STATE_STATUS);
    frame_packet(HANDSHAKE_PACKET_ID, &data)
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error("status response timed out")]
    ReadTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    VarInt(#[from] VarIntError),
    #[error("expected packet id {expected:#04x}, got {actual:#04x}")]
    PacketMismatch { expected: i32, actual: i32 },
    #[error("invalid status payload length {0}")]
    PayloadLength(i32),
    #[error("invalid status document: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Players {
    pub max: i64,
    pub online: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusVersion {
    pub name: Option<String>,
    pub protocol: Option<i32>,
}

/// The JSON document a server returns for a status request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusDocument {
    #[serde(default)]
    pub version: Option<StatusVersion>,
    #[serde(default)]
    pub players: Option<Players>,
    #[serde(default)]
    pub description: Option<serde_json::Value>,
    #[serde(default)]
    pub favicon: Option<String>,
}

/// Flattens a chat component (string, `{text, extra}` object or array) to
/// plain text.
fn chat_text(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => out.push_str(s),
        serde_json::Value::Array(parts) => parts.iter().for_each(|p| chat_text(p, out)),
        serde_json::Value::Object(obj) => {
            if let Some(text) = obj.get("text") {
                chat_text(text, out);
            }
            if let Some(extra) = obj.get("extra") {
                chat_text(extra, out);
            }
        }
        _ => {}
    }
}

/// What callers of the status endpoint see. Offline results carry only the
/// address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameStatus {
    pub online: bool,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub players: Option<Players>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

impl GameStatus {
    pub fn offline(host: impl Into<String>, port: u16) -> Self {
        Self {
            online: false,
            host: host.into(),
            port,
            version: None,
            players: None,
            description: None,
            favicon: None,
        }
    }

    pub fn from_document(doc: StatusDocument, host: impl Into<String>, port: u16) -> Self {
        let description = doc.description.as_ref().map(|d| {
            let mut s = String::new();
            chat_text(d, &mut s);
            s
        });
        Self {
            online: true,
            host: host.into(),
            port,
            version: doc.version.and_then(|v| v.name),
            players: doc.players,
            description,
            favicon: doc.favicon,
        }
    }
}

/// Reads one status response packet and parses its JSON payload.
pub async fn read_status_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<StatusDocument, ProbeError> {
    let _frame_len = read_varint(r).await?;
    let packet_id = read_varint(r).await?;
    if packet_id != STATUS_RESPONSE_PACKET_ID {
        return Err(ProbeError::PacketMismatch {
            expected: STATUS_RESPONSE_PACKET_ID,
            actual: packet_id,
        });
    }
    let len = read_varint(r).await?;
    let size = usize::try_from(len)
        .ok()
        .filter(|n| (1..=MAX_STATUS_PAYLOAD).contains(n))
        .ok_or(ProbeError::PayloadLength(len))?;
    let mut payload = vec![0u8; size];
    r.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[derive(Debug, Clone)]
pub struct StatusProbe {
    config: StatusProbeConfig,
}

impl StatusProbe {
    pub fn new(config: StatusProbeConfig) -> Self {
        Self { config }
    }

    /// Never fails: any problem reads as offline.
    pub async fn probe(&self) -> GameStatus {
        let cfg = &self.config;
        match self.try_probe().await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(host = %cfg.connect_host, port = cfg.port, error = %e, "status probe failed");
                GameStatus::offline(cfg.public_host.clone(), cfg.port)
            }
        }
    }

    pub async fn try_probe(&self) -> Result<GameStatus, ProbeError> {
        let cfg = &self.config;
        let connect = TcpStream::connect((cfg.connect_host.as_str(), cfg.port));
        let mut stream = tokio::time::timeout(cfg.connect_timeout, connect)
            .await
            .map_err(|_| ProbeError::ConnectTimeout {
                addr: format!("{}:{}", cfg.connect_host, cfg.port),
            })??;

        let mut request = handshake_packet(&cfg.connect_host, cfg.port, cfg.protocol_version);
        request.extend_from_slice(&STATUS_REQUEST);
        stream.write_all(&request).await?;

        let doc = tokio::time::timeout(cfg.read_timeout, read_status_response(&mut stream))
            .await
            .map_err(|_| ProbeError::ReadTimeout)??;
        Ok(GameStatus::from_document(doc, cfg.public_host.clone(), cfg.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RconError {
    #[error("packet truncated")]
    Truncated,
    #[error("invalid packet length {0}")]
    InvalidLength(i32),
    #[error("packet is missing its null terminator")]
    MissingTerminator,
}

/// Remote-console packet: `i32 len ‖ i32 request id ‖ i32 type ‖ payload ‖ 0 0`,
/// all little-endian; `len` counts everything after itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconPacket {
    pub request_id: i32,
    pub kind: i32,
    pub payload: String,
}

impl RconPacket {
    pub const RESPONSE: i32 = 0;
    pub const COMMAND: i32 = 2;
    pub const LOGIN: i32 = 3;
    const MIN_LEN: i32 = 10;
    const MAX_LEN: i32 = 4096 + Self::MIN_LEN;

    pub fn login(request_id: i32, password: &str) -> Self {
        Self {
            request_id,
            kind: Self::LOGIN,
            payload: password.to_string(),
        }
    }

    pub fn command(request_id: i32, command: &str) -> Self {
        Self {
            request_id,
            kind: Self::COMMAND,
            payload: command.to_string(),
        }
    }

    /// Payloads longer than 4096 bytes are refused, matching what
    /// [`RconPacket::decode`] accepts.
    pub fn encode(&self) -> Result<Vec<u8>, RconError> {
        let len = i32::try_from(self.payload.len())
            .ok()
            .and_then(|n| n.checked_add(Self::MIN_LEN))
            .unwrap_or(i32::MAX);
        if len > Self::MAX_LEN {
            return Err(RconError::InvalidLength(len));
        }
        let mut out = Vec::with_capacity(4 + len as usize);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(self.payload.as_bytes());
        out.extend_from_slice(&[0, 0]);
        Ok(out)
    }

    /// Decodes one packet from the front of `buf`, returning it and the bytes
    /// consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), RconError> {
        let word = |at: usize| -> Result<i32, RconError> {
            let raw = buf.get(at..at + 4).ok_or(RconError::Truncated)?;
            Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        };

        let len = word(0)?;
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&len) {
            return Err(RconError::InvalidLength(len));
        }
        let total = 4 + len as usize;
        let body = buf.get(4..total).ok_or(RconError::Truncated)?;
        let payload = body
            .get(8..body.len() - 2)
            .ok_or(RconError::Truncated)?;
        if body[body.len() - 2..] != [0, 0] {
            return Err(RconError::MissingTerminator);
        }

        Ok((
            Self {
                request_id: word(4)?,
                kind: word(8)?,
                payload: String::from_utf8_lossy(payload).into_owned(),
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    const VECTORS: &[(i32, &[u8])] = &[
        (0, &[0x00]),
        (1, &[0x01]),
        (127, &[0x7f]),
        (128, &[0x80, 0x01]),
        (255, &[0xff, 0x01]),
        (25565, &[0xdd, 0xc7, 0x01]),
        (2_097_151, &[0xff, 0xff, 0x7f]),
        (i32::MAX, &[0xff, 0xff, 0xff, 0xff, 0x07]),
        (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
        (i32::MIN, &[0x80, 0x80, 0x80, 0x80, 0x08]),
    ];

    #[test]
    fn varint_matches_reference_encodings() {
        for (value, bytes) in VECTORS {
            let mut buf = Vec::new();
            write_varint(&mut buf, *value);
            assert_eq!(buf, *bytes, "encode {value}");
            assert_eq!(decode_varint(bytes), Ok((*value, bytes.len())), "decode {value}");
        }
    }

    #[test]
    fn varint_decode_ignores_trailing_bytes() {
        assert_eq!(decode_varint(&[0xdd, 0xc7, 0x01, 0x42]), Ok((25565, 3)));
    }

    #[test]
    fn varint_rejects_sixth_byte() {
        assert_eq!(
            decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(VarIntError::TooLarge)
        );
        assert_eq!(
            decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x80]),
            Err(VarIntError::TooLarge)
        );
        assert_eq!(decode_varint(&[0x80, 0x80]), Err(VarIntError::Truncated));
        assert_eq!(decode_varint(&[]), Err(VarIntError::Truncated));
    }

    #[tokio::test]
    async fn async_varint_reader_rejects_oversized_input() {
        let mut input: &[u8] = &[0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let err = read_varint(&mut input).await.unwrap_err();
        assert!(matches!(err, ProbeError::VarInt(VarIntError::TooLarge)));
        assert_eq!(err.to_string(), "VarInt too large");
    }

    #[test]
    fn handshake_layout() {
        let packet = handshake_packet("localhost", 25565, 767);
        let mut expected = vec![16, 0x00, 0xff, 0x05, 9];
        expected.extend_from_slice(b"localhost");
        expected.extend_from_slice(&[0x63, 0xdd, 0x01]);
        assert_eq!(packet, expected);

        let (len, used) = decode_varint(&packet).unwrap();
        assert_eq!(len as usize, packet.len() - used);
    }

    #[test]
    fn description_accepts_string_and_chat_component() {
        let plain: StatusDocument =
            serde_json::from_str(r#"{"description":"A Minecraft Server"}"#).unwrap();
        let s = GameStatus::from_document(plain, "h", 1);
        assert_eq!(s.description.as_deref(), Some("A Minecraft Server"));

        let rich: StatusDocument = serde_json::from_str(
            r#"{"version":{"name":"1.21","protocol":767},
                "description":{"text":"A ","extra":[{"text":"B","bold":true},"C"]}}"#,
        )
        .unwrap();
        let s = GameStatus::from_document(rich, "h", 1);
        assert_eq!(s.description.as_deref(), Some("A BC"));
        assert_eq!(s.version.as_deref(), Some("1.21"));
        assert!(s.players.is_none());
    }

    #[test]
    fn offline_status_serializes_address_only() {
        let json = serde_json::to_value(GameStatus::offline("play.example.net", 25565)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"online": false, "host": "play.example.net", "port": 25565})
        );
    }

    #[test]
    fn rcon_packet_layout() {
        let bytes = RconPacket::command(7, "list").encode().unwrap();
        assert_eq!(&bytes[0..4], &14i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &RconPacket::COMMAND.to_le_bytes());
        assert_eq!(&bytes[12..16], b"list");
        assert_eq!(&bytes[16..], &[0, 0]);

        let login = RconPacket::login(1, "secret");
        let (decoded, used) = RconPacket::decode(&login.encode().unwrap()).unwrap();
        assert_eq!(decoded, login);
        assert_eq!(used, 4 + 10 + 6);
    }

    #[test]
    fn rcon_decode_rejects_malformed_input() {
        let mut bytes = RconPacket::command(1, "say hi").encode().unwrap();
        assert_eq!(RconPacket::decode(&bytes[..8]), Err(RconError::Truncated));
        assert_eq!(
            RconPacket::decode(&bytes[..bytes.len() - 1]),
            Err(RconError::Truncated)
        );
        let last = bytes.len() - 1;
        bytes[last] = b'x';
        assert_eq!(RconPacket::decode(&bytes), Err(RconError::MissingTerminator));
        assert_eq!(
            RconPacket::decode(&2i32.to_le_bytes()),
            Err(RconError::InvalidLength(2))
        );
    }

    #[test]
    fn rcon_encode_refuses_payloads_decode_would_reject() {
        let largest = RconPacket::command(3, &"a".repeat(4096));
        let (decoded, _) = RconPacket::decode(&largest.encode().unwrap()).unwrap();
        assert_eq!(decoded, largest);

        assert_eq!(
            RconPacket::command(3, &"a".repeat(4097)).encode(),
            Err(RconError::InvalidLength(4107))
        );
    }

    fn probe_config(port: u16) -> StatusProbeConfig {
        StatusProbeConfig {
            public_host: "play.example.net".to_string(),
            connect_host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_millis(500),
            protocol_version: 767,
        }
    }

    /// Accepts one connection, consumes handshake + status request, replies with
    /// `response`.
    async fn fake_server(response: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let len = read_varint(&mut sock).await.unwrap();
            let mut handshake = vec![0u8; len as usize];
            sock.read_exact(&mut handshake).await.unwrap();
            let mut request = [0u8; 2];
            sock.read_exact(&mut request).await.unwrap();
            assert_eq!(request, STATUS_REQUEST);
            sock.write_all(&response).await.unwrap();
        });
        port
    }

    fn status_response(packet_id: i32, json: &str) -> Vec<u8> {
        let mut data = Vec::new();
        write_string(&mut data, json);
        frame_packet(packet_id, &data)
    }

    #[tokio::test]
    async fn probe_reads_live_status() {
        let json = r#"{"version":{"name":"1.21","protocol":767},
            "players":{"max":20,"online":3},
            "description":{"text":"A Minecraft Server"}}"#;
        let port = fake_server(status_response(0x00, json)).await;

        let status = StatusProbe::new(probe_config(port)).probe().await;
        assert!(status.online);
        assert_eq!(status.host, "play.example.net");
        assert_eq!(status.port, port);
        assert_eq!(status.version.as_deref(), Some("1.21"));
        assert_eq!(status.players, Some(Players { max: 20, online: 3 }));
        assert_eq!(status.description.as_deref(), Some("A Minecraft Server"));
    }

    #[tokio::test]
    async fn probe_rejects_unexpected_packet_id() {
        let port = fake_server(status_response(0x01, "{}")).await;
        let err = StatusProbe::new(probe_config(port)).try_probe().await.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::PacketMismatch {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn probe_reports_offline_when_nothing_listens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let status = StatusProbe::new(probe_config(port)).probe().await;
        assert_eq!(status, GameStatus::offline("play.example.net", port));
    }

    #[tokio::test]
    async fn probe_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = StatusProbe::new(probe_config(port)).try_probe().await.unwrap_err();
        assert!(matches!(err, ProbeError::ReadTimeout));
    }
}
