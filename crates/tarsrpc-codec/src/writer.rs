use std::io::{ErrorKind, Write};

use bytes::BytesMut;
use tarsrpc_transport::RpcStream;

use crate::error::{CodecError, Result};
use crate::frame::{encode_frame, FrameConfig, HEADER_SIZE};
use crate::reader::transport_to_codec_error;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete packages to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Frame and send an envelope body.
    pub fn send(&mut self, body: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_frame(body, &mut self.buf, self.config.max_package_size)?;
        let packet = self.buf.split().freeze();
        self.write_packet(&packet)
    }

    /// Send a package that already carries its length header.
    pub fn write_packet(&mut self, packet: &[u8]) -> Result<()> {
        if packet.len() <= HEADER_SIZE || packet.len() > self.config.max_package_size {
            return Err(CodecError::InvalidLength {
                length: packet.len() as i64,
                min: HEADER_SIZE + 1,
                max: self.config.max_package_size,
            });
        }

        let mut offset = 0usize;
        while offset < packet.len() {
            match self.inner.write(&packet[offset..]) {
                Ok(0) => return Err(CodecError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(CodecError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) => return Err(CodecError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameWriter<RpcStream> {
    /// Create a frame writer for `RpcStream` and apply write timeout from config.
    pub fn with_config_tcp(inner: RpcStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_write_timeout(config.write_timeout)
            .map_err(transport_to_codec_error)?;
        Ok(Self::with_config(inner, config))
    }
}
