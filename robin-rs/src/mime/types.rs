use super::headers::MimeHeaders;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Semantic kind of a body leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Text,
    File,
}

/// One decoded body leaf with its digests.
#[derive(Debug, Clone)]
pub struct MimePart {
    pub headers: MimeHeaders,
    pub kind: PartKind,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub size: usize,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

impl MimePart {
    /// Builds a leaf from decoded bytes, computing all three digests
    /// (Base64-encoded) over the decoded content.
    pub fn new(headers: MimeHeaders, kind: PartKind, filename: String, bytes: Vec<u8>) -> Self {
        let md5 = BASE64.encode(Md5::digest(&bytes));
        let sha1 = BASE64.encode(Sha1::digest(&bytes));
        let sha256 = BASE64.encode(Sha256::digest(&bytes));
        let size = bytes.len();
        Self {
            headers,
            kind,
            filename,
            bytes,
            size,
            md5,
            sha1,
            sha256,
        }
    }
}

/// Fully parsed message: top-level headers plus the flattened leaf list.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub headers: MimeHeaders,
    pub parts: Vec<MimePart>,
}

impl ParsedMessage {
    pub fn message_id(&self) -> Option<&str> {
        self.headers.value("Message-ID")
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digests_over_bytes() {
        let part = MimePart::new(
            MimeHeaders::new(),
            PartKind::Text,
            "part.0.txt".to_string(),
            b"hello".to_vec(),
        );
        assert_eq!(part.size, 5);
        // Base64 of the raw digest, not hex.
        assert_eq!(part.md5, "XUFAKrxLKna5cZ2REBfFkg==");
        assert_eq!(part.sha256, "LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=");
    }

    #[test]
    fn test_empty_part_digests_defined() {
        let part = MimePart::new(
            MimeHeaders::new(),
            PartKind::File,
            "part.0.dat".to_string(),
            Vec::new(),
        );
        assert_eq!(part.size, 0);
        assert_eq!(part.md5, "1B2M2Y8AsgTpgAmY7PhCfg==");
    }
}
