//! wmhub-protocol: wire definitions for the window manager control
//! connection and the status-line protocol.
//!
//! The control connection speaks magic-prefixed binary frames with JSON
//! payloads; the status line is newline-delimited JSON on stdout with click
//! events arriving as JSON lines on stdin.

pub mod codec;
pub mod messages;
pub mod status;

// Re-export main types at crate root
pub use codec::{CodecError, IpcCodec, OutFrame};
pub use messages::{CommandKind, EventKind, RawMessage, EVENT_FLAG, MAGIC};
pub use status::{block_matches, content_blocks, ClickEvent, ClickFraming, StatusHeader};

/// Version reported in the status-line capability header
pub const STATUS_PROTOCOL_VERSION: u32 = 1;
