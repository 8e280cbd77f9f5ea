use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::frame::{decode_frame, encode_frame, MAX_PACKAGE_SIZE};

/// `tokio_util` framer for length-prefixed packages.
///
/// Decodes to envelope bytes without the length header and frames outgoing
/// envelope bytes, so it pairs with [`crate::Codec::parse_request`] and
/// [`crate::Codec::parse_response`].
#[derive(Debug, Clone)]
pub struct TarsFrameCodec {
    max_package_size: usize,
}

impl TarsFrameCodec {
    pub fn new() -> Self {
        Self {
            max_package_size: MAX_PACKAGE_SIZE,
        }
    }

    pub fn with_max_package_size(max_package_size: usize) -> Self {
        Self { max_package_size }
    }
}

impl Default for TarsFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TarsFrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src, self.max_package_size)
    }
}

impl Encoder<Bytes> for TarsFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&item, dst, self.max_package_size)
    }
}
