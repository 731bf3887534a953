//! Wire protocol for cix: typed messages over length-prefixed frames, plus
//! the fixed-size multicast job announcement datagram.

mod framing;
mod message;
mod multicast;

pub use framing::{
    decode_message, encode_message, read_message, read_message_sync, write_message,
    write_message_sync, MAX_MESSAGE_BYTES,
};
pub use message::{
    CompileMessage, CreateOutputMessage, IndexerMessage, JobRequestMessage, JobResponseMessage,
    LogLevel, Message, MulticastForwardMessage, QueryFlags, QueryKind, QueryMessage,
    VisitFileMessage, VisitFileResponseMessage, WireJob,
};
pub use multicast::{decode_announcements, encode_announcement, JobAnnouncement, ANNOUNCEMENT_LEN};

/// Errors produced while encoding, decoding or framing messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte cap")]
    FrameTooLarge { len: usize, max: usize },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unexpected multicast header byte {header:#04x}")]
    BadAnnouncementHeader { header: u8 },

    #[error("{residue} trailing bytes after multicast records")]
    AnnouncementResidue { residue: usize },

    #[error("peer disconnected")]
    Disconnected,
}
