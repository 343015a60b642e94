use std::io::{self, Read};

use rbs_protocol::{Call, Value};
use rbs_store::BlobReader;

use crate::remote::RemoteHandle;
use crate::server::MAX_READ_CHUNK;

/// Reads a blob through a remote stream reference.
///
/// Owned by a [`rbs_store::ManagedStream`] on the client, which makes close
/// idempotent and reports it to the client's stream registry.
pub struct ClientInputStream {
    remote: RemoteHandle,
    eof: bool,
}

impl ClientInputStream {
    pub fn new(remote: RemoteHandle) -> Self {
        Self { remote, eof: false }
    }
}

impl Read for ClientInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.eof {
            return Ok(0);
        }
        let max = buf.len().min(MAX_READ_CHUNK) as u32;
        let bytes = self
            .remote
            .call_as(Call::Read { max }, Value::expect_bytes)
            .map_err(io::Error::other)?;
        if bytes.len() > buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("remote returned {} bytes for a {}-byte read", bytes.len(), buf.len()),
            ));
        }
        if bytes.is_empty() {
            self.eof = true;
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

impl BlobReader for ClientInputStream {
    fn close(&mut self) -> io::Result<()> {
        self.remote
            .call_as(Call::CloseStream, Value::expect_unit)
            .map_err(io::Error::other)
    }
}
