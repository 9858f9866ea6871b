//! Range-aware download subsystem.

mod engine;
mod range;

pub use engine::{Download, DownloadEngine, DownloadRequest, ResponseHeaders};
pub use range::{parse_range_header, ByteRange};
