//! MIME message parsing: line reader, header rules, boundary descent,
//! transfer-encoding decode and per-part digests.

pub mod headers;
pub mod parser;
pub mod reader;
pub mod types;

pub use headers::{MimeHeader, MimeHeaders};
pub use parser::MimeParser;
pub use reader::LineReader;
pub use types::{MimePart, ParsedMessage, PartKind};
