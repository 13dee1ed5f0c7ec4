//! Data channel framing
//!
//! Text frames carry JSON control messages, binary frames carry file chunk
//! bytes:
//!
//! ```text
//! {"type":"text","text":"hi"}
//! {"type":"file-meta","meta":{"id":"...","name":"a.png","size":1234,"mime":"image/png"}}
//! <binary chunk>
//! {"type":"file-complete","id":"..."}
//! ```
//!
//! With [`ChunkFraming::Tagged`] each binary chunk starts with a `u16`
//! big-endian id length followed by the UTF-8 transfer id.

use crate::config::ChunkFraming;
use crate::error::ProtocolViolation;
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Announcement of an incoming file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Transfer id
    pub id: String,

    /// File name
    pub name: String,

    /// Total size in bytes
    pub size: u64,

    /// MIME type, sent as `""` when unknown
    #[serde(
        default,
        serialize_with = "serialize_mime",
        deserialize_with = "deserialize_mime"
    )]
    pub mime: Option<String>,
}

fn serialize_mime<S: Serializer>(
    mime: &Option<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(mime.as_deref().unwrap_or(""))
}

fn deserialize_mime<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    let mime = Option::<String>::deserialize(deserializer)?;
    Ok(mime.filter(|m| !m.is_empty()))
}

/// Control frame sent as JSON text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Complete chat message
    Text { text: String },

    /// Start of a file transfer
    FileMeta { meta: FileMeta },

    /// No more chunks for the transfer
    #[serde(alias = "file-end")]
    FileComplete { id: String },
}

impl ControlFrame {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize control frame: {}", e))
        })
    }
}

/// Raw message as delivered by the data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Control frame
    Control(ControlFrame),

    /// File chunk; `transfer_id` is only known with tagged framing
    Chunk {
        transfer_id: Option<String>,
        data: Bytes,
    },
}

/// Decode a data channel message
///
/// Fails closed: anything that is not a well-formed frame is reported as a
/// violation and nothing of it is applied.
pub fn decode_payload(
    payload: ChannelPayload,
    framing: ChunkFraming,
) -> std::result::Result<InboundFrame, ProtocolViolation> {
    match payload {
        ChannelPayload::Text(text) => serde_json::from_str::<ControlFrame>(&text)
            .map(InboundFrame::Control)
            .map_err(|e| ProtocolViolation::MalformedControl(e.to_string())),
        ChannelPayload::Binary(data) => match framing {
            ChunkFraming::Raw => Ok(InboundFrame::Chunk {
                transfer_id: None,
                data,
            }),
            ChunkFraming::Tagged => {
                let (id, data) = decode_tagged_chunk(data)?;
                Ok(InboundFrame::Chunk {
                    transfer_id: Some(id),
                    data,
                })
            }
        },
    }
}

/// Prefix a chunk with its transfer id
pub fn encode_tagged_chunk(transfer_id: &str, chunk: &[u8]) -> Result<Bytes> {
    let id = transfer_id.as_bytes();
    let id_len = u16::try_from(id.len()).map_err(|_| {
        Error::TransferError(format!("Transfer id too long: {} bytes", id.len()))
    })?;

    let mut buf = BytesMut::with_capacity(2 + id.len() + chunk.len());
    buf.put_u16(id_len);
    buf.put_slice(id);
    buf.put_slice(chunk);
    Ok(buf.freeze())
}

/// Split a tagged chunk into transfer id and payload
pub fn decode_tagged_chunk(
    data: Bytes,
) -> std::result::Result<(String, Bytes), ProtocolViolation> {
    if data.len() < 2 {
        return Err(ProtocolViolation::MalformedChunkHeader(format!(
            "{} byte frame is shorter than the header",
            data.len()
        )));
    }

    let id_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + id_len {
        return Err(ProtocolViolation::MalformedChunkHeader(format!(
            "id length {} exceeds frame of {} bytes",
            id_len,
            data.len()
        )));
    }

    let id = std::str::from_utf8(&data[2..2 + id_len])
        .map_err(|e| ProtocolViolation::MalformedChunkHeader(e.to_string()))?
        .to_string();

    Ok((id, data.slice(2 + id_len..)))
}
