//! Frame header and construction

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command;
use crate::message::Message;
use crate::wire::WireError;

/// Wire size of the fixed header.
pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    /// Zero on requests; the command being answered on replies.
    pub reply_cmd: u16,
    pub request_id: u32,
    pub payload_len: u32,
}

impl Header {
    pub fn is_reply(&self) -> bool {
        command::is_reply(self.command)
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.command);
        buf.put_u16(self.reply_cmd);
        buf.put_u32(self.request_id);
        buf.put_u32(self.payload_len);
    }

    pub fn read_from(buf: &mut impl Buf) -> Self {
        Self {
            command: buf.get_u16(),
            reply_cmd: buf.get_u16(),
            request_id: buf.get_u32(),
            payload_len: buf.get_u32(),
        }
    }
}

/// A complete frame: header plus raw payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    /// Build a request frame for `msg`.
    pub fn request(request_id: u32, msg: &Message) -> Frame {
        let payload = msg.encode_payload();
        Frame {
            header: Header {
                command: msg.command(),
                reply_cmd: 0,
                request_id,
                payload_len: payload.len() as u32,
            },
            payload,
        }
    }

    /// Build a reply frame answering the request carried by `to`.
    pub fn reply(to: &Header, msg: &Message) -> Frame {
        let payload = msg.encode_payload();
        Frame {
            header: Header {
                command: msg.command(),
                reply_cmd: to.command,
                request_id: to.request_id,
                payload_len: payload.len() as u32,
            },
            payload,
        }
    }

    /// Decode the typed message carried by this frame.
    pub fn message(&self) -> Result<Message, WireError> {
        Message::decode(self.header.command, &self.payload)
    }
}
