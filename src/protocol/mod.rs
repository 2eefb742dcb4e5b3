//! Wire protocol shared by every TCP endpoint.
//!
//! Frames are an ASCII decimal length, a line feed, then exactly that many
//! payload bytes. Payloads are JSON objects: job submissions inbound to the
//! master, task dispatches inbound to workers, and `{err}` responses in the
//! other direction.

pub mod frame;
pub mod messages;

pub use frame::{encode, read_frame, write_frame, FrameCodec};
pub use messages::{
    ErrResponse, GroupSubmission, JobSubmission, JobSummary, Submission, TaskOutcome, TaskRequest,
};
