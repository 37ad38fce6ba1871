//! Length-prefixed framing.
//!
//! Every frame is an 8-byte header followed by the payload:
//!
//! ```text
//! +----------------+----------------+------------------------+
//! | data_len u32LE | msg_id  u32LE  | payload (data_len)     |
//! +----------------+----------------+------------------------+
//! ```
//!
//! Decoding is split in two steps so the payload size can be checked
//! against the configured maximum before any buffer is allocated for it.

use crate::error::{Error, Result};
use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Stateless frame encoder/decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    /// Largest accepted payload; 0 disables the check.
    max_package_size: u32,
}

impl Codec {
    pub fn new(max_package_size: u32) -> Self {
        Self { max_package_size }
    }

    pub fn max_package_size(&self) -> u32 {
        self.max_package_size
    }

    /// Encode a message into a single contiguous frame.
    pub fn encode(&self, msg: &Message) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.data().len());
        buf.put_u32_le(msg.data_len());
        buf.put_u32_le(msg.id());
        buf.extend_from_slice(msg.data());
        buf.freeze()
    }

    /// Decode a frame header into a message with an empty payload.
    pub fn decode(&self, header: &[u8]) -> Result<Message> {
        let header: &[u8; HEADER_LEN] = header
            .try_into()
            .map_err(|_| Error::InvalidHeader(header.len()))?;

        let data_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if self.max_package_size > 0 && data_len > self.max_package_size {
            return Err(Error::OversizedMessage {
                len: data_len,
                max: self.max_package_size,
            });
        }

        Ok(Message::from_header(id, data_len))
    }

    /// Read exactly one frame: the header, then `data_len` payload bytes.
    ///
    /// A clean EOF before the header surfaces as an
    /// [`UnexpectedEof`](std::io::ErrorKind::UnexpectedEof) I/O error.
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let mut msg = self.decode(&header)?;

        if msg.data_len() > 0 {
            let mut data = vec![0u8; msg.data_len() as usize];
            reader.read_exact(&mut data).await?;
            msg.set_data(Bytes::from(data));
        }

        Ok(msg)
    }
}
