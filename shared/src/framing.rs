//! Length-prefixed framing for stream transports.
//!
//! Wire format: `[u32 length (big-endian)][bincode payload]`. The length
//! prefix is handled by [`LengthDelimitedCodec`]; [`PacketCodec`] adds the
//! bincode layer so a socket can be wrapped in `Framed`, `FramedRead` or
//! `FramedWrite` and used as a stream/sink of [`Packet`]s.

use crate::protocol::Packet;
use bytes::{Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Frames larger than this are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame larger than {} bytes", MAX_FRAME_LEN)]
    TooLarge,
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Io(std::io::Error),
}

impl From<io::Error> for FrameError {
    /// The length codec reports oversized frames as I/O errors.
    fn from(e: io::Error) -> Self {
        let oversized = e
            .get_ref()
            .map_or(false, |inner| inner.is::<LengthDelimitedCodecError>());
        if oversized {
            FrameError::TooLarge
        } else {
            FrameError::Io(e)
        }
    }
}

/// Bincode [`Packet`]s inside length-delimited frames.
#[derive(Debug)]
pub struct PacketCodec {
    frames: LengthDelimitedCodec,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(payload) => Ok(Some(bincode::deserialize(&payload)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&item)?;
        self.frames.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}
