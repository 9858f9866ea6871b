//! Chunked upload subsystem: session records and the upload engine.

mod engine;
mod session;

pub use engine::{
    ChunkOutcome, ChunkStatus, InitRequest, InitResponse, ResumeInfo, SessionProgress,
    UploadEngine, UploadGuide,
};
pub use session::{
    CachedSession, ChunkEntry, NewSession, SessionRepository, SessionStatus, UploadSession,
};
