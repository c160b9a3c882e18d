//! Replication packet taxonomy and payload codecs.
//!
//! Five packet kinds travel over the framed TCP stream between peers; a sixth
//! (`ALIVE`) is a bare one-byte UDP multicast datagram used for liveness only
//! and never carries data.
//!
//! # Payload layout
//!
//! String fields are UTF-8, terminated by `\n`; timestamps are big-endian
//! `i64` nanoseconds. Record values are single-line JSON documents.
//!
//! | Type                  | Payload                                                |
//! |-----------------------|--------------------------------------------------------|
//! | `SET`                 | `ts` `ns \n coll \n key \n json \n`                    |
//! | `DELETE`              | `ts` `ns \n coll \n key \n`                            |
//! | `COLLECTION_REQUEST`  | `ns \n coll \n`                                        |
//! | `COLLECTION_RESPONSE` | `ns \n coll \n` then repeated `key \n json \n` records |
//! | `SERVER_CLOSE`        | empty                                                  |
//! | `ALIVE`               | empty (UDP liveness only)                              |

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum accepted frame payload length.
///
/// A whole-collection snapshot is the largest frame on the wire; anything past
/// this limit is treated as a protocol violation rather than an allocation
/// request.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One-byte packet discriminator on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Replicated write of a single record.
    Set = 1,
    /// Replicated removal of a single record.
    Delete = 2,
    /// Client asks the server for a whole-collection snapshot.
    CollectionRequest = 3,
    /// Server streams a whole-collection snapshot back.
    CollectionResponse = 4,
    /// Server announces shutdown; clients start re-dialing.
    ServerClose = 5,
    /// Liveness announcement (UDP multicast only).
    Alive = 6,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(byte: u8) -> Result<Self, PacketError> {
        match byte {
            1 => Ok(Self::Set),
            2 => Ok(Self::Delete),
            3 => Ok(Self::CollectionRequest),
            4 => Ok(Self::CollectionResponse),
            5 => Ok(Self::ServerClose),
            6 => Ok(Self::Alive),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// Errors raised while decoding a frame or its payload.
///
/// Decode failures are dropped at the apply boundary; they never tear down
/// the node.
#[derive(Debug, Error)]
pub enum PacketError {
    /// The type byte does not name a known packet kind.
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    /// The payload ended before all declared fields were read.
    #[error("truncated packet payload")]
    Truncated,
    /// A string field is not valid UTF-8.
    #[error("packet field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// The declared frame length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized(usize),
    /// Transport-level failure while reading a frame.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Payload of a [`Packet::Set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetPayload {
    /// Nanosecond timestamp attached at the write site.
    pub ts: i64,
    /// Namespace the collection belongs to.
    pub namespace: String,
    /// Collection name.
    pub collection: String,
    /// Record key.
    pub key: String,
    /// Single-line JSON encoding of the record value.
    pub json: String,
}

/// Payload of a [`Packet::Delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Nanosecond timestamp attached at the write site.
    pub ts: i64,
    /// Namespace the collection belongs to.
    pub namespace: String,
    /// Collection name.
    pub collection: String,
    /// Record key.
    pub key: String,
}

/// A decoded replication packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Replicated write.
    Set(SetPayload),
    /// Replicated removal.
    Delete(DeletePayload),
    /// Snapshot request for one collection.
    CollectionRequest {
        /// Namespace the collection belongs to.
        namespace: String,
        /// Collection name.
        collection: String,
    },
    /// Snapshot of one collection, `(key, json)` per record, unsorted.
    CollectionResponse {
        /// Namespace the collection belongs to.
        namespace: String,
        /// Collection name.
        collection: String,
        /// All records of the collection at snapshot time.
        records: Vec<(String, String)>,
    },
    /// Server shutdown announcement.
    ServerClose,
    /// Liveness announcement.
    Alive,
}

impl Packet {
    /// Returns the wire discriminator for this packet.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Set(_) => PacketType::Set,
            Self::Delete(_) => PacketType::Delete,
            Self::CollectionRequest { .. } => PacketType::CollectionRequest,
            Self::CollectionResponse { .. } => PacketType::CollectionResponse,
            Self::ServerClose => PacketType::ServerClose,
            Self::Alive => PacketType::Alive,
        }
    }

    /// Encodes the payload (everything after the frame header).
    #[must_use]
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Self::Set(p) => {
                buf.put_i64(p.ts);
                put_line(&mut buf, &p.namespace);
                put_line(&mut buf, &p.collection);
                put_line(&mut buf, &p.key);
                put_line(&mut buf, &p.json);
            }
            Self::Delete(p) => {
                buf.put_i64(p.ts);
                put_line(&mut buf, &p.namespace);
                put_line(&mut buf, &p.collection);
                put_line(&mut buf, &p.key);
            }
            Self::CollectionRequest {
                namespace,
                collection,
            } => {
                put_line(&mut buf, namespace);
                put_line(&mut buf, collection);
            }
            Self::CollectionResponse {
                namespace,
                collection,
                records,
            } => {
                put_line(&mut buf, namespace);
                put_line(&mut buf, collection);
                for (key, json) in records {
                    put_line(&mut buf, key);
                    put_line(&mut buf, json);
                }
            }
            Self::ServerClose | Self::Alive => {}
        }

        buf.freeze()
    }

    /// Decodes a payload for the given packet type.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] when a declared field is missing and
    /// [`PacketError::InvalidUtf8`] when a string field is malformed.
    pub fn decode(packet_type: PacketType, mut payload: Bytes) -> Result<Self, PacketError> {
        match packet_type {
            PacketType::Set => {
                let ts = take_i64(&mut payload)?;
                Ok(Self::Set(SetPayload {
                    ts,
                    namespace: take_line(&mut payload)?,
                    collection: take_line(&mut payload)?,
                    key: take_line(&mut payload)?,
                    json: take_line(&mut payload)?,
                }))
            }
            PacketType::Delete => {
                let ts = take_i64(&mut payload)?;
                Ok(Self::Delete(DeletePayload {
                    ts,
                    namespace: take_line(&mut payload)?,
                    collection: take_line(&mut payload)?,
                    key: take_line(&mut payload)?,
                }))
            }
            PacketType::CollectionRequest => Ok(Self::CollectionRequest {
                namespace: take_line(&mut payload)?,
                collection: take_line(&mut payload)?,
            }),
            PacketType::CollectionResponse => {
                let namespace = take_line(&mut payload)?;
                let collection = take_line(&mut payload)?;
                let mut records = Vec::new();
                while !payload.is_empty() {
                    let key = take_line(&mut payload)?;
                    let json = take_line(&mut payload)?;
                    records.push((key, json));
                }
                Ok(Self::CollectionResponse {
                    namespace,
                    collection,
                    records,
                })
            }
            PacketType::ServerClose => Ok(Self::ServerClose),
            PacketType::Alive => Ok(Self::Alive),
        }
    }
}

fn put_line(buf: &mut BytesMut, field: &str) {
    buf.put_slice(field.as_bytes());
    buf.put_u8(b'\n');
}

fn take_line(payload: &mut Bytes) -> Result<String, PacketError> {
    let end = payload
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(PacketError::Truncated)?;
    let line = payload.split_to(end);
    // Consume the delimiter.
    let _ = payload.split_to(1);
    Ok(String::from_utf8(line.to_vec())?)
}

fn take_i64(payload: &mut Bytes) -> Result<i64, PacketError> {
    if payload.len() < 8 {
        return Err(PacketError::Truncated);
    }
    let raw = payload.split_to(8);
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&raw);
    Ok(i64::from_be_bytes(bytes))
}
