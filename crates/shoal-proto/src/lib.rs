//! Shoal wire protocol
//!
//! Length-prefixed request/reply frames carried over TCP.  Every frame is a
//! 12-byte header followed by a typed payload:
//!
//! ```text
//! +----------+------------+--------------+-------------+----------...
//! | command  | reply_cmd  | request_id   | payload_len | payload
//! |   u16    |    u16     |     u32      |     u32     |
//! +----------+------------+--------------+-------------+----------...
//! ```
//!
//! Integers travel in network byte order; strings are length-prefixed
//! UTF-8.  `reply_cmd` is zero on requests and names the command being
//! answered on replies.

mod codec;
pub mod command;
mod frame;
mod message;
mod wire;

pub use codec::ShoalCodec;
pub use frame::{Frame, Header, HEADER_LEN};
pub use message::Message;
pub use wire::{PayloadReader, PayloadWriter, WireError};
