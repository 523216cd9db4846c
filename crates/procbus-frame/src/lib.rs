//! Separator-delimited message framing for the procbus wire protocol.
//!
//! Every message on the bus is one [`Frame`]: a typed envelope with routing
//! and correlation fields plus an opaque payload. The envelope is
//! decimal-ASCII for numeric fields and raw bytes for the payload:
//!
//! ```text
//! #<type>!<chain_key>#<module>|<method>|<sender>#<kind>|<size>|<payload bytes>
//! ```
//!
//! The [`Decoder`] is an incremental state machine: feed it byte chunks of
//! any size and it hands back completed frames, preserving its position
//! across calls. No partial-read handling in user code.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    encode_frame, Decoder, Frame, FrameConfig, FrameType, PayloadKind, DEFAULT_MAX_PAYLOAD,
};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
