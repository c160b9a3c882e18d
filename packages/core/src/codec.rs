//! Frame codec for the replication stream.
//!
//! Every frame is `type:u8 || length:u64-be || payload[length]`. The codec
//! decodes frames incrementally (a frame may arrive across many reads) and
//! rejects declared lengths past [`MAX_FRAME_LEN`] instead of allocating.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{Packet, PacketError, PacketType, MAX_FRAME_LEN};

const HEADER_LEN: usize = 1 + 8;

/// [`Encoder`]/[`Decoder`] for [`Packet`] frames over a reliable ordered stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    /// Creates the codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0_u8; 8];
        length_bytes.copy_from_slice(&src[1..HEADER_LEN]);
        let length = u64::from_be_bytes(length_bytes);
        let length = usize::try_from(length).map_err(|_| PacketError::Oversized(usize::MAX))?;

        if length > MAX_FRAME_LEN {
            return Err(PacketError::Oversized(length));
        }

        if src.len() < HEADER_LEN + length {
            // Wait for the rest of the frame before consuming anything.
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        let type_byte = src[0];
        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();

        let packet_type = PacketType::try_from(type_byte)?;
        Packet::decode(packet_type, payload).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), PacketError> {
        let payload = packet.encode_payload();
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(packet.packet_type() as u8);
        dst.put_u64(payload.len() as u64);
        dst.put_slice(&payload);
        Ok(())
    }
}
