//! Range-serving downloads.

pub mod downloader;
pub mod range;

pub use downloader::{Download, DownloadDescriptor, DownloadRequest, Downloader, DEFAULT_PART_SIZE};
pub use range::{parse_range_header, ByteRange, ParsedRange, RangeSpec};
