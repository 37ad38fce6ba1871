//! Message and request value types.

use crate::connection::Connection;
use bytes::Bytes;
use std::sync::Arc;

/// One frame of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: u32,
    data_len: u32,
    data: Bytes,
}

impl Message {
    /// Create a message carrying `data`.
    ///
    /// # Panics
    /// Panics if `data` is longer than `u32::MAX` bytes, which the wire
    /// format cannot express.
    pub fn new(id: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        assert!(data.len() <= u32::MAX as usize, "payload length exceeds u32");
        Self {
            id,
            data_len: data.len() as u32,
            data,
        }
    }

    /// Header-only message produced by decoding; payload is attached later.
    pub(crate) fn from_header(id: u32, data_len: u32) -> Self {
        Self {
            id,
            data_len,
            data: Bytes::new(),
        }
    }

    /// Attach the payload read after the header.
    pub(crate) fn set_data(&mut self, data: Bytes) {
        debug_assert_eq!(data.len(), self.data_len as usize);
        self.data = data;
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload length as announced on the wire.
    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// A decoded message together with the connection it arrived on.
pub struct Request {
    conn: Arc<Connection>,
    msg: Message,
}

impl Request {
    pub fn new(conn: Arc<Connection>, msg: Message) -> Self {
        Self { conn, msg }
    }

    /// Connection the message was read from.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn message(&self) -> &Message {
        &self.msg
    }

    pub fn msg_id(&self) -> u32 {
        self.msg.id()
    }

    pub fn data(&self) -> &Bytes {
        self.msg.data()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("conn_id", &self.conn.id())
            .field("msg_id", &self.msg.id())
            .field("data_len", &self.msg.data_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sets_length() {
        let msg = Message::new(7, &b"hello"[..]);
        assert_eq!(msg.id(), 7);
        assert_eq!(msg.data_len(), 5);
        assert_eq!(msg.data().as_ref(), b"hello");
    }

    #[test]
    fn test_header_then_payload() {
        let mut msg = Message::from_header(2, 3);
        assert_eq!(msg.data_len(), 3);
        assert!(msg.data().is_empty());

        msg.set_data(Bytes::from_static(b"abc"));
        assert_eq!(msg, Message::new(2, Bytes::from_static(b"abc")));
    }
}
