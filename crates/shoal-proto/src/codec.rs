//! Framed codec for tokio streams

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use shoal_core::MAX_PAYLOAD;

use crate::frame::{Frame, Header, HEADER_LEN};
use crate::wire::WireError;

/// `tokio_util` codec producing and consuming [`Frame`]s.
#[derive(Debug, Default)]
pub struct ShoalCodec;

impl Decoder for ShoalCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // peek the header without consuming until the whole frame is here
        let header = Header::read_from(&mut &src[..HEADER_LEN]);
        if header.payload_len > MAX_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                WireError::Oversize(header.payload_len),
            ));
        }

        let total = HEADER_LEN + header.payload_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(header.payload_len as usize).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for ShoalCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_LEN + frame.payload.len());
        frame.header.write_to(dst);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
