//! Wire protocol between master and workers.
//!
//! Everything on the control channel is an [`Envelope`]: a message kind, a
//! correlation id, and an opaque JSON payload. Envelopes travel as
//! length-prefixed JSON frames ([`frame`]) over a persistent TCP connection.
//! The payload schemas live in [`messages`]; the envelope layer never
//! interprets them.

pub mod envelope;
pub mod frame;
pub mod messages;

pub use envelope::{Envelope, EnvelopeKind};
pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
