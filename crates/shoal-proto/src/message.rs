//! Typed messages and their payload codecs

use bytes::Bytes;

use crate::command as cmd;
use crate::wire::{PayloadReader, PayloadWriter, WireError};

/// Every command and reply the protocol knows, with decoded payloads.
///
/// Optional strings travel as empty strings; `name_int` zero means the item
/// carries no integer name.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // -- requests ---------------------------------------------------------
    ServerHello {
        addr: String,
        capabilities: u32,
    },
    LoadLevels,
    AcceptBucket {
        mask: u64,
        hash: u64,
    },
    ControlBucket {
        mask: u64,
        hash: u64,
        level: u8,
    },
    SyncName {
        hash: u64,
        name: String,
    },
    Sync {
        map: u64,
        hash: u64,
        name_int: i64,
        expires: i32,
        value: Bytes,
    },
    FinaliseMigration {
        mask: u64,
        hash: u64,
        new_role: u8,
    },
    Promote {
        hash: u64,
    },
    HashmaskUpdate {
        mask: u64,
        hash: u64,
        primary: String,
        secondary: String,
    },
    BucketRelocated {
        mask: u64,
        hash: u64,
        moved_role: u8,
        new_addr: String,
    },
    Get {
        map: u64,
        hash: u64,
    },
    Set {
        map: u64,
        hash: u64,
        expires: i32,
        value: Bytes,
    },

    // -- replies ----------------------------------------------------------
    Ack,
    Unknown,
    ReplyLoadLevels {
        primary: i32,
        backups: i32,
        transferring: i32,
    },
    AcceptingBucket {
        mask: u64,
        hash: u64,
    },
    ControlBucketComplete {
        mask: u64,
        hash: u64,
    },
    SyncNameAck {
        hash: u64,
    },
    SyncAck {
        map: u64,
        hash: u64,
    },
    MigrationAck {
        mask: u64,
        hash: u64,
    },
    RelocatedAck {
        mask: u64,
        hash: u64,
    },
    Value {
        map: u64,
        hash: u64,
        value: Bytes,
    },
    Stored {
        map: u64,
        hash: u64,
    },
    Moved {
        addr: String,
    },
}

impl Message {
    /// The wire code for this message.
    pub fn command(&self) -> u16 {
        match self {
            Message::ServerHello { .. } => cmd::SERVERHELLO,
            Message::LoadLevels => cmd::LOADLEVELS,
            Message::AcceptBucket { .. } => cmd::ACCEPT_BUCKET,
            Message::ControlBucket { .. } => cmd::CONTROL_BUCKET,
            Message::SyncName { .. } => cmd::SYNC_NAME,
            Message::Sync { .. } => cmd::SYNC,
            Message::FinaliseMigration { .. } => cmd::FINALISE_MIGRATION,
            Message::Promote { .. } => cmd::PROMOTE,
            Message::HashmaskUpdate { .. } => cmd::HASHMASK_UPDATE,
            Message::BucketRelocated { .. } => cmd::BUCKET_RELOCATED,
            Message::Get { .. } => cmd::GET,
            Message::Set { .. } => cmd::SET,
            Message::Ack => cmd::REPLY_ACK,
            Message::Unknown => cmd::REPLY_UNKNOWN,
            Message::ReplyLoadLevels { .. } => cmd::REPLY_LOADLEVELS,
            Message::AcceptingBucket { .. } => cmd::REPLY_ACCEPTING_BUCKET,
            Message::ControlBucketComplete { .. } => cmd::REPLY_CONTROL_BUCKET_COMPLETE,
            Message::SyncNameAck { .. } => cmd::REPLY_SYNC_NAME_ACK,
            Message::SyncAck { .. } => cmd::REPLY_SYNC_ACK,
            Message::MigrationAck { .. } => cmd::REPLY_MIGRATION_ACK,
            Message::RelocatedAck { .. } => cmd::REPLY_RELOCATED_ACK,
            Message::Value { .. } => cmd::REPLY_VALUE,
            Message::Stored { .. } => cmd::REPLY_STORED,
            Message::Moved { .. } => cmd::REPLY_MOVED,
        }
    }

    pub fn is_reply(&self) -> bool {
        cmd::is_reply(self.command())
    }

    /// Encode the payload portion of this message.
    pub fn encode_payload(&self) -> Bytes {
        let mut w = PayloadWriter::new();
        match self {
            Message::ServerHello { addr, capabilities } => {
                w.put_str(addr);
                w.put_u32(*capabilities);
            }
            Message::LoadLevels | Message::Ack | Message::Unknown => {}
            Message::AcceptBucket { mask, hash }
            | Message::AcceptingBucket { mask, hash }
            | Message::ControlBucketComplete { mask, hash }
            | Message::MigrationAck { mask, hash }
            | Message::RelocatedAck { mask, hash } => {
                w.put_u64(*mask);
                w.put_u64(*hash);
            }
            Message::ControlBucket { mask, hash, level } => {
                w.put_u64(*mask);
                w.put_u64(*hash);
                w.put_u8(*level);
            }
            Message::SyncName { hash, name } => {
                w.put_u64(*hash);
                w.put_str(name);
            }
            Message::Sync {
                map,
                hash,
                name_int,
                expires,
                value,
            } => {
                w.put_u64(*map);
                w.put_u64(*hash);
                w.put_i64(*name_int);
                w.put_i32(*expires);
                w.put_blob(value);
            }
            Message::FinaliseMigration { mask, hash, new_role } => {
                w.put_u64(*mask);
                w.put_u64(*hash);
                w.put_u8(*new_role);
            }
            Message::Promote { hash } => {
                w.put_u64(*hash);
            }
            Message::HashmaskUpdate {
                mask,
                hash,
                primary,
                secondary,
            } => {
                w.put_u64(*mask);
                w.put_u64(*hash);
                w.put_str(primary);
                w.put_str(secondary);
            }
            Message::BucketRelocated {
                mask,
                hash,
                moved_role,
                new_addr,
            } => {
                w.put_u64(*mask);
                w.put_u64(*hash);
                w.put_u8(*moved_role);
                w.put_str(new_addr);
            }
            Message::Get { map, hash } => {
                w.put_u64(*map);
                w.put_u64(*hash);
            }
            Message::Set {
                map,
                hash,
                expires,
                value,
            } => {
                w.put_u64(*map);
                w.put_u64(*hash);
                w.put_i32(*expires);
                w.put_blob(value);
            }
            Message::ReplyLoadLevels {
                primary,
                backups,
                transferring,
            } => {
                w.put_i32(*primary);
                w.put_i32(*backups);
                w.put_i32(*transferring);
            }
            Message::SyncNameAck { hash } => {
                w.put_u64(*hash);
            }
            Message::SyncAck { map, hash } | Message::Stored { map, hash } => {
                w.put_u64(*map);
                w.put_u64(*hash);
            }
            Message::Value { map, hash, value } => {
                w.put_u64(*map);
                w.put_u64(*hash);
                w.put_blob(value);
            }
            Message::Moved { addr } => {
                w.put_str(addr);
            }
        }
        w.finish()
    }

    /// Decode a payload for `command` into a typed message.
    pub fn decode(command: u16, payload: &[u8]) -> Result<Message, WireError> {
        let mut r = PayloadReader::new(payload);
        let msg = match command {
            cmd::SERVERHELLO => Message::ServerHello {
                addr: r.str()?,
                capabilities: r.u32()?,
            },
            cmd::LOADLEVELS => Message::LoadLevels,
            cmd::ACCEPT_BUCKET => Message::AcceptBucket {
                mask: r.u64()?,
                hash: r.u64()?,
            },
            cmd::CONTROL_BUCKET => Message::ControlBucket {
                mask: r.u64()?,
                hash: r.u64()?,
                level: r.u8()?,
            },
            cmd::SYNC_NAME => Message::SyncName {
                hash: r.u64()?,
                name: r.str()?,
            },
            cmd::SYNC => Message::Sync {
                map: r.u64()?,
                hash: r.u64()?,
                name_int: r.i64()?,
                expires: r.i32()?,
                value: r.blob()?,
            },
            cmd::FINALISE_MIGRATION => Message::FinaliseMigration {
                mask: r.u64()?,
                hash: r.u64()?,
                new_role: r.u8()?,
            },
            cmd::PROMOTE => Message::Promote { hash: r.u64()? },
            cmd::HASHMASK_UPDATE => Message::HashmaskUpdate {
                mask: r.u64()?,
                hash: r.u64()?,
                primary: r.str()?,
                secondary: r.str()?,
            },
            cmd::BUCKET_RELOCATED => Message::BucketRelocated {
                mask: r.u64()?,
                hash: r.u64()?,
                moved_role: r.u8()?,
                new_addr: r.str()?,
            },
            cmd::GET => Message::Get {
                map: r.u64()?,
                hash: r.u64()?,
            },
            cmd::SET => Message::Set {
                map: r.u64()?,
                hash: r.u64()?,
                expires: r.i32()?,
                value: r.blob()?,
            },
            cmd::REPLY_ACK => Message::Ack,
            cmd::REPLY_UNKNOWN => Message::Unknown,
            cmd::REPLY_LOADLEVELS => Message::ReplyLoadLevels {
                primary: r.i32()?,
                backups: r.i32()?,
                transferring: r.i32()?,
            },
            cmd::REPLY_ACCEPTING_BUCKET => Message::AcceptingBucket {
                mask: r.u64()?,
                hash: r.u64()?,
            },
            cmd::REPLY_CONTROL_BUCKET_COMPLETE => Message::ControlBucketComplete {
                mask: r.u64()?,
                hash: r.u64()?,
            },
            cmd::REPLY_SYNC_NAME_ACK => Message::SyncNameAck { hash: r.u64()? },
            cmd::REPLY_SYNC_ACK => Message::SyncAck {
                map: r.u64()?,
                hash: r.u64()?,
            },
            cmd::REPLY_MIGRATION_ACK => Message::MigrationAck {
                mask: r.u64()?,
                hash: r.u64()?,
            },
            cmd::REPLY_RELOCATED_ACK => Message::RelocatedAck {
                mask: r.u64()?,
                hash: r.u64()?,
            },
            cmd::REPLY_VALUE => Message::Value {
                map: r.u64()?,
                hash: r.u64()?,
                value: r.blob()?,
            },
            cmd::REPLY_STORED => Message::Stored {
                map: r.u64()?,
                hash: r.u64()?,
            },
            cmd::REPLY_MOVED => Message::Moved { addr: r.str()? },
            other => return Err(WireError::UnknownCommand(other)),
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let payload = msg.encode_payload();
        let decoded = Message::decode(msg.command(), &payload).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_round_trips() {
        round_trip(Message::ServerHello {
            addr: "10.0.0.1:13600".to_string(),
            capabilities: 0,
        });
        round_trip(Message::Sync {
            map: 3,
            hash: 0xfeed,
            name_int: -9,
            expires: 300,
            value: Bytes::from_static(b"payload"),
        });
        round_trip(Message::HashmaskUpdate {
            mask: 0x7,
            hash: 5,
            primary: "a:1".to_string(),
            secondary: String::new(),
        });
        round_trip(Message::BucketRelocated {
            mask: 0x3,
            hash: 2,
            moved_role: 1,
            new_addr: "b:2".to_string(),
        });
        round_trip(Message::ReplyLoadLevels {
            primary: 4,
            backups: 0,
            transferring: 1,
        });
        round_trip(Message::Ack);
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            Message::decode(0x7777, &[]),
            Err(WireError::UnknownCommand(0x7777))
        );
    }

    #[test]
    fn test_truncated_payload() {
        let payload = Message::AcceptBucket { mask: 0x3, hash: 1 }.encode_payload();
        assert_eq!(
            Message::decode(cmd::ACCEPT_BUCKET, &payload[..10]),
            Err(WireError::Truncated)
        );
    }
}
