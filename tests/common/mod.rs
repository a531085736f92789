// tests/common/mod.rs
//! Common test utilities for sync integration tests.

pub mod mock_apis;
pub mod mock_source;

pub use mock_apis::{MemoryFileApi, MemoryTranscriptApi};
pub use mock_source::ChannelSource;
