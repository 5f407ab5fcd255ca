use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

use crate::protocol::error::RpcError;
use crate::protocol::frame::Frame;

/// The size of the frame prefix that contains the payload size.
const PREFIX_SIZE: usize = std::mem::size_of::<u32>();

/// Maximum payload size accepted in either direction.
///
/// Bounds the allocation a single peer can force on us.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// An encoder/decoder of [`Frame`]s.
///
/// Frames are length-delimited by a little-endian [`u32`] prefix. The payload
/// layout is: 16 correlation-id bytes, a `u16` name length followed by that
/// many UTF-8 name bytes (0 when absent), a little-endian `i32` priority and
/// the body bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: Frame, buffer: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_size = frame.encoded_len();
        if payload_size > MAX_FRAME_SIZE {
            return Err(RpcError::Serialization(format!(
                "frame is {payload_size} bytes but can't be larger than {MAX_FRAME_SIZE} bytes"
            )));
        }

        let name = frame.name.as_deref().unwrap_or("");
        if name.len() > u16::MAX as usize {
            return Err(RpcError::Serialization(format!(
                "request name is {} bytes but can't be larger than {} bytes",
                name.len(),
                u16::MAX
            )));
        }

        buffer.reserve(PREFIX_SIZE + payload_size);
        buffer.put_u32_le(payload_size as u32);
        buffer.put_slice(frame.id.as_bytes());
        buffer.put_u16_le(name.len() as u16);
        buffer.put_slice(name.as_bytes());
        buffer.put_i32_le(frame.priority);
        buffer.put_slice(&frame.body);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buffer.len() < PREFIX_SIZE {
            return Ok(None);
        }

        let mut start_of_buffer: &[u8] = buffer;
        let payload_size = start_of_buffer.get_u32_le() as usize;
        if payload_size > MAX_FRAME_SIZE {
            return Err(RpcError::Deserialization(format!(
                "incoming frame claims {payload_size} bytes, limit is {MAX_FRAME_SIZE} bytes"
            )));
        }

        let frame_size = PREFIX_SIZE + payload_size;
        if buffer.len() < frame_size {
            buffer.reserve(frame_size - buffer.len());
            return Ok(None);
        }

        let _prefix = buffer.split_to(PREFIX_SIZE);
        let mut payload = buffer.split_to(payload_size);

        // id + name length at minimum
        if payload.len() < 16 + 2 {
            return Err(RpcError::Deserialization(
                "frame payload shorter than its fixed header".to_string(),
            ));
        }

        let mut id_bytes = [0u8; 16];
        payload.copy_to_slice(&mut id_bytes);
        let id = Uuid::from_bytes(id_bytes);

        let name_len = payload.get_u16_le() as usize;
        if payload.len() < name_len + 4 {
            return Err(RpcError::Deserialization(
                "frame name length exceeds payload".to_string(),
            ));
        }
        let name = if name_len == 0 {
            None
        } else {
            let raw = payload.split_to(name_len);
            Some(
                std::str::from_utf8(&raw)
                    .map_err(|e| RpcError::Deserialization(format!("frame name is not UTF-8: {e}")))?
                    .to_string(),
            )
        };

        let priority = payload.get_i32_le();
        let body: Bytes = payload.freeze();

        Ok(Some(Frame {
            id,
            name,
            priority,
            body,
        }))
    }
}
