//! Resumable conversation transcripts.
//!
//! Each conversation has its own named-frame stream. The log is filled from
//! a history page first, then the live stream is opened after the last id
//! held, so reconnects replay only newer events and duplicates are dropped.

mod api;
mod cache;
mod event;
mod log;
mod stream;


pub use api::{HistoryPage, HistoryQuery, HttpTranscriptApi, TranscriptApi, TranscriptError};
pub use cache::TranscriptCache;
pub use event::{TranscriptEvent, KIND_SESSION_BOUNDARY};
pub use log::ConversationLog;
pub use stream::{ConversationStream, TranscriptSync};
