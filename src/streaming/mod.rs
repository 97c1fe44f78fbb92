//! Streaming progress protocol.
//!
//! ```text
//! Pipe:     stdout chunks --> FrameDecoder --> ProgressSession --> Deferred
//! Channel:  ws messages   ------------------> ProgressSession --> Deferred
//! ```
//!
//! `protocol` holds the NUL-sentinel framing, `session` classifies and
//! dispatches messages for one call, `pipeline` drives a transport through a
//! session until the call settles.

pub mod pipeline;
pub mod protocol;
pub mod session;

pub use pipeline::{drive, start};
pub use protocol::{encode_frame, is_finished, FrameDecoder, Phase, FINISHED_KEY, SENTINEL};
pub use session::ProgressSession;
