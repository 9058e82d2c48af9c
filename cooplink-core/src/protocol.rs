use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::error::ErrorCode;

/// ASCII magic bytes that open every cooplink frame.
const MAGIC: &[u8; 5] = b"COOPL";
/// Protocol version understood by this build.
pub const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
pub const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024;
/// Fixed prefix of a `FileChunk` payload: transfer id (8) + file index (4).
const CHUNK_PREFIX_LEN: usize = 12;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Protocol-level message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ConnectRequest = 0x10,
    ConnectReply = 0x11,
    ConnectCancel = 0x12,
    Disconnect = 0x13,
    Ping = 0x18,
    Pong = 0x19,
    TransferOffer = 0x20,
    TransferDecision = 0x21,
    FileChunk = 0x22,
    FileEnd = 0x23,
    TransferDone = 0x24,
    TransferCancel = 0x25,
    InputEvent = 0x30,
    ClipboardUpdate = 0x31,
    Error = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x10 => Ok(Self::ConnectRequest),
            0x11 => Ok(Self::ConnectReply),
            0x12 => Ok(Self::ConnectCancel),
            0x13 => Ok(Self::Disconnect),
            0x18 => Ok(Self::Ping),
            0x19 => Ok(Self::Pong),
            0x20 => Ok(Self::TransferOffer),
            0x21 => Ok(Self::TransferDecision),
            0x22 => Ok(Self::FileChunk),
            0x23 => Ok(Self::FileEnd),
            0x24 => Ok(Self::TransferDone),
            0x25 => Ok(Self::TransferCancel),
            0x30 => Ok(Self::InputEvent),
            0x31 => Ok(Self::ClipboardUpdate),
            0x7F => Ok(Self::Error),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags — MUST be `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))` — a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)` — not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)` — protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload).  The caller should close the connection.
///
/// # Errors
///
/// Returns an error on protocol violations: bad magic, unsupported version,
/// unknown message type, or payload exceeding [`MAX_PAYLOAD_LEN`].
///
/// # Panics
///
/// Cannot panic. The `expect` calls on slice conversions are guarded by the
/// `HEADER_LEN` check at the top of the function.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected COOPL"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    // These slices are exactly 2 and 4 bytes respectively (guaranteed by
    // the HEADER_LEN check above), so the conversions cannot fail.
    let flags = u16::from_be_bytes(
        buf[OFF_FLAGS..OFF_FLAGS + 2]
            .try_into()
            .expect("flags slice is exactly 2 bytes"),
    );

    let payload_len = u32::from_be_bytes(
        buf[OFF_LENGTH..OFF_LENGTH + 4]
            .try_into()
            .expect("length slice is exactly 4 bytes"),
    ) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).freeze();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

fn put_header(msg_type: MessageType, payload_len: usize, buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload_len);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload_len as u32);
}

/// Encodes a frame into `buf`.
///
/// Appends the 13-byte header followed by `payload` to the buffer.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    put_header(msg_type, payload.len(), buf);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

// ── JSON payload types ──────────────────────────────────────────────

/// Payload for [`MessageType::ConnectRequest`]; always the first frame on a
/// new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequestPayload {
    pub device_id: DeviceId,
    pub device_name: String,
    /// Port of the requester's own session listener, so the receiver can
    /// register it as a peer.
    pub listen_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReplyPayload {
    pub accept: bool,
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorCode>,
}

/// Withdraws a pending request; `reason` is `Canceled` or `TimedOut`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectCancelPayload {
    pub reason: ErrorCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferedFile {
    /// Relative path, `/`-separated; a single component for a loose file.
    pub name: String,
    pub size: u64,
}

/// Payload for [`MessageType::TransferOffer`] (sender → receiver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOfferPayload {
    /// Sender-chosen id, unique within the session.
    pub transfer_id: u64,
    pub files: Vec<OfferedFile>,
}

impl TransferOfferPayload {
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Payload for [`MessageType::TransferDecision`] (receiver → sender).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDecisionPayload {
    pub transfer_id: u64,
    pub accept: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorCode>,
}

/// Payload for [`MessageType::FileEnd`] (sender → receiver), sent after the
/// last chunk of each file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEndPayload {
    pub transfer_id: u64,
    pub file_index: u32,
    pub sha256_hex: String,
}

/// Payload for [`MessageType::TransferDone`] (receiver → sender).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDonePayload {
    pub transfer_id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorCode>,
}

/// Payload for [`MessageType::TransferCancel`] (either direction).
///
/// `reason` is `Canceled` for a voluntary stop; anything else reports a
/// local failure that ended the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelPayload {
    pub transfer_id: u64,
    pub reason: ErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEvent {
    /// Platform-neutral key code.
    pub code: u32,
    pub pressed: bool,
    #[serde(default)]
    pub modifiers: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerEvent {
    Move { dx: i32, dy: i32 },
    Button { button: u8, pressed: bool },
    Scroll { dx: i32, dy: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputEvent {
    Key(KeyEvent),
    Pointer(PointerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEventPayload {
    /// Strictly increasing per session and direction.
    pub seq: u64,
    pub event: InputEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardUpdatePayload {
    /// Lamport timestamp of the change.
    pub stamp: u64,
    pub origin: DeviceId,
    pub text: String,
}

/// Payload for [`MessageType::Error`] (either direction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Encodes a serializable payload into a protocol frame stored in a new
/// [`BytesMut`].
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    ensure!(
        json.len() <= MAX_PAYLOAD_LEN,
        "payload too large: {} bytes (max {MAX_PAYLOAD_LEN})",
        json.len()
    );
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

// ── Binary file chunks ──────────────────────────────────────────────

/// One slice of file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub transfer_id: u64,
    pub file_index: u32,
    pub data: Bytes,
}

/// Largest `data` slice that fits in one `FileChunk` frame.
pub const MAX_CHUNK_DATA_LEN: usize = MAX_PAYLOAD_LEN - CHUNK_PREFIX_LEN;

/// Encodes a `FileChunk` frame without an intermediate payload copy.
///
/// # Errors
///
/// Returns an error if `data` exceeds [`MAX_CHUNK_DATA_LEN`].
pub fn encode_file_chunk(transfer_id: u64, file_index: u32, data: &[u8]) -> Result<BytesMut> {
    ensure!(
        data.len() <= MAX_CHUNK_DATA_LEN,
        "chunk too large: {} bytes (max {MAX_CHUNK_DATA_LEN})",
        data.len()
    );
    let mut buf = BytesMut::new();
    put_header(MessageType::FileChunk, CHUNK_PREFIX_LEN + data.len(), &mut buf);
    buf.put_u64(transfer_id);
    buf.put_u32(file_index);
    buf.put_slice(data);
    Ok(buf)
}

fn decode_file_chunk(mut payload: Bytes) -> Result<FileChunk> {
    ensure!(
        payload.len() >= CHUNK_PREFIX_LEN,
        "file chunk too short: {} bytes",
        payload.len()
    );
    let transfer_id = payload.get_u64();
    let file_index = payload.get_u32();
    Ok(FileChunk {
        transfer_id,
        file_index,
        data: payload,
    })
}

// ── Typed messages ──────────────────────────────────────────────────

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    ConnectRequest(ConnectRequestPayload),
    ConnectReply(ConnectReplyPayload),
    ConnectCancel(ConnectCancelPayload),
    Disconnect,
    Ping,
    Pong,
    TransferOffer(TransferOfferPayload),
    TransferDecision(TransferDecisionPayload),
    FileChunk(FileChunk),
    FileEnd(FileEndPayload),
    TransferDone(TransferDonePayload),
    TransferCancel(TransferCancelPayload),
    InputEvent(InputEventPayload),
    ClipboardUpdate(ClipboardUpdatePayload),
    Error(ErrorPayload),
}

impl Message {
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::ConnectRequest(_) => MessageType::ConnectRequest,
            Self::ConnectReply(_) => MessageType::ConnectReply,
            Self::ConnectCancel(_) => MessageType::ConnectCancel,
            Self::Disconnect => MessageType::Disconnect,
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::TransferOffer(_) => MessageType::TransferOffer,
            Self::TransferDecision(_) => MessageType::TransferDecision,
            Self::FileChunk(_) => MessageType::FileChunk,
            Self::FileEnd(_) => MessageType::FileEnd,
            Self::TransferDone(_) => MessageType::TransferDone,
            Self::TransferCancel(_) => MessageType::TransferCancel,
            Self::InputEvent(_) => MessageType::InputEvent,
            Self::ClipboardUpdate(_) => MessageType::ClipboardUpdate,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Encodes the message as a complete frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or is too large.
    pub fn encode(&self) -> Result<BytesMut> {
        let ty = self.msg_type();
        match self {
            Self::ConnectRequest(p) => encode_payload_frame(ty, p),
            Self::ConnectReply(p) => encode_payload_frame(ty, p),
            Self::ConnectCancel(p) => encode_payload_frame(ty, p),
            Self::Disconnect | Self::Ping | Self::Pong => Ok(encode_frame_to_bytes(ty, &[])),
            Self::TransferOffer(p) => encode_payload_frame(ty, p),
            Self::TransferDecision(p) => encode_payload_frame(ty, p),
            Self::FileChunk(c) => encode_file_chunk(c.transfer_id, c.file_index, &c.data),
            Self::FileEnd(p) => encode_payload_frame(ty, p),
            Self::TransferDone(p) => encode_payload_frame(ty, p),
            Self::TransferCancel(p) => encode_payload_frame(ty, p),
            Self::InputEvent(p) => encode_payload_frame(ty, p),
            Self::ClipboardUpdate(p) => encode_payload_frame(ty, p),
            Self::Error(p) => encode_payload_frame(ty, p),
        }
    }

    /// Interprets a decoded frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match the frame's type.
    pub fn decode(frame: Frame) -> Result<Self> {
        let p = &frame.payload;
        let msg = match frame.header.msg_type {
            MessageType::ConnectRequest => Self::ConnectRequest(decode_payload(p)?),
            MessageType::ConnectReply => Self::ConnectReply(decode_payload(p)?),
            MessageType::ConnectCancel => Self::ConnectCancel(decode_payload(p)?),
            MessageType::Disconnect => Self::Disconnect,
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
            MessageType::TransferOffer => Self::TransferOffer(decode_payload(p)?),
            MessageType::TransferDecision => Self::TransferDecision(decode_payload(p)?),
            MessageType::FileChunk => Self::FileChunk(decode_file_chunk(frame.payload.clone())?),
            MessageType::FileEnd => Self::FileEnd(decode_payload(p)?),
            MessageType::TransferDone => Self::TransferDone(decode_payload(p)?),
            MessageType::TransferCancel => Self::TransferCancel(decode_payload(p)?),
            MessageType::InputEvent => Self::InputEvent(decode_payload(p)?),
            MessageType::ClipboardUpdate => Self::ClipboardUpdate(decode_payload(p)?),
            MessageType::Error => Self::Error(decode_payload(p)?),
        };
        Ok(msg)
    }
}
