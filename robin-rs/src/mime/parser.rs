//! Streaming MIME parser: header block, recursive boundary descent,
//! transfer-encoding decode, per-leaf digests.
//!
//! The produced part list is flat: a nested multipart contributes its
//! children, not itself, and `message/rfc822` parts are re-entered
//! recursively with their leaves joining the top-level list.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::warn;

use super::headers::MimeHeaders;
use super::reader::LineReader;
use super::types::{MimePart, ParsedMessage, PartKind};
use crate::error::Result;

pub struct MimeParser;

impl MimeParser {
    /// Parses a byte stream positioned at the start of an RFC-822 message.
    pub fn parse(message: &[u8]) -> Result<ParsedMessage> {
        let mut reader = LineReader::new(message);
        let headers = MimeHeaders::read_from(&mut reader);
        let mut parts = Vec::new();
        Self::parse_body(&mut reader, &headers, &mut parts);
        Ok(ParsedMessage { headers, parts })
    }

    /// Parses the body governed by `headers`, consuming `reader` to EOF and
    /// appending leaves to `parts`.
    fn parse_body(reader: &mut LineReader<'_>, headers: &MimeHeaders, parts: &mut Vec<MimePart>) {
        let boundary = headers.get("Content-Type").and_then(|ct| {
            let primary = ct.primary_value().to_lowercase();
            if primary.starts_with("multipart/") {
                ct.param("boundary").map(|b| b.to_string())
            } else {
                None
            }
        });

        match boundary {
            Some(boundary) => Self::parse_multipart(reader, &boundary, parts),
            None => {
                let body = reader.read_to_end();
                Self::push_leaf(headers.clone(), body, parts);
            }
        }
    }

    /// Boundary descent: children between `--boundary` lines, stopping at
    /// `--boundary--` or EOF (a missing terminator consumes to EOF as the
    /// last part). Preamble and epilogue content is discarded.
    fn parse_multipart(reader: &mut LineReader<'_>, boundary: &str, parts: &mut Vec<MimePart>) {
        loop {
            match reader.read_line() {
                None => return,
                Some(line) => {
                    if Self::is_terminator(&line, boundary) {
                        return;
                    }
                    if Self::is_boundary(&line, boundary) {
                        break;
                    }
                }
            }
        }

        loop {
            let part_headers = MimeHeaders::read_from(reader);
            let body = Self::collect_part_body(reader, boundary);
            Self::handle_part(part_headers, body, parts);

            match reader.read_line() {
                None => return,
                Some(line) if Self::is_terminator(&line, boundary) => return,
                Some(_) => continue,
            }
        }
    }

    /// Reads body lines up to the next boundary line, which is pushed back
    /// for the caller to classify. The line break immediately preceding the
    /// boundary belongs to the boundary, not the body.
    fn collect_part_body(reader: &mut LineReader<'_>, boundary: &str) -> Vec<u8> {
        let mut body = Vec::new();

        while let Some(line) = reader.read_line() {
            if Self::is_boundary(&line, boundary) || Self::is_terminator(&line, boundary) {
                reader.unread(&line);
                if body.ends_with(b"\r\n") {
                    body.truncate(body.len() - 2);
                } else if body.ends_with(b"\n") {
                    body.truncate(body.len() - 1);
                }
                break;
            }
            body.extend_from_slice(&line);
        }

        body
    }

    fn is_boundary(line: &[u8], boundary: &str) -> bool {
        let text = String::from_utf8_lossy(line);
        text.trim_end() == format!("--{}", boundary)
    }

    fn is_terminator(line: &[u8], boundary: &str) -> bool {
        let text = String::from_utf8_lossy(line);
        text.trim_end() == format!("--{}--", boundary)
    }

    fn handle_part(headers: MimeHeaders, body: Vec<u8>, parts: &mut Vec<MimePart>) {
        let primary = headers
            .get("Content-Type")
            .map(|ct| ct.primary_value().to_lowercase())
            .unwrap_or_default();

        if primary.starts_with("multipart/") {
            // Nested multiparts descend with their own declared boundary.
            if let Some(inner) = headers
                .get("Content-Type")
                .and_then(|ct| ct.param("boundary"))
                .map(|b| b.to_string())
            {
                let mut inner_reader = LineReader::new(&body);
                Self::parse_multipart(&mut inner_reader, &inner, parts);
                return;
            }
            // Declared multipart without a boundary degrades to a leaf.
            Self::push_leaf(headers, body, parts);
            return;
        }

        if primary == "message/rfc822" {
            let mut inner_reader = LineReader::new(&body);
            let inner_headers = MimeHeaders::read_from(&mut inner_reader);
            if !inner_headers.is_empty() {
                Self::parse_body(&mut inner_reader, &inner_headers, parts);
                return;
            }
            // Not re-enterable: keep the raw message as a file leaf.
            let index = parts.len();
            let filename = Self::derive_filename(&headers, &primary, index);
            parts.push(MimePart::new(headers, PartKind::File, filename, body));
            return;
        }

        Self::push_leaf(headers, body, parts);
    }

    fn push_leaf(headers: MimeHeaders, raw_body: Vec<u8>, parts: &mut Vec<MimePart>) {
        let decoded = Self::decode_transfer_encoding(&headers, raw_body);

        let primary = headers
            .get("Content-Type")
            .map(|ct| ct.primary_value().to_lowercase())
            .unwrap_or_default();

        let is_attachment = headers
            .get("Content-Disposition")
            .map(|cd| cd.primary_value().eq_ignore_ascii_case("attachment"))
            .unwrap_or(false);

        let textual = primary.is_empty()
            || primary.starts_with("text/")
            || primary.starts_with("message/");
        let kind = if is_attachment || !textual {
            PartKind::File
        } else {
            PartKind::Text
        };

        let index = parts.len();
        let filename = Self::derive_filename(&headers, &primary, index);
        parts.push(MimePart::new(headers, kind, filename, decoded));
    }

    /// Content-Disposition `filename=`, else Content-Type `name=`, else a
    /// name synthesized from the leaf index and declared type.
    fn derive_filename(headers: &MimeHeaders, primary: &str, index: usize) -> String {
        if let Some(name) = headers
            .get("Content-Disposition")
            .and_then(|cd| cd.param("filename"))
        {
            return name.to_string();
        }
        if let Some(name) = headers.get("Content-Type").and_then(|ct| ct.param("name")) {
            return name.to_string();
        }

        if primary == "text/html" {
            format!("part.{}.html", index)
        } else if primary == "text/calendar" {
            format!("part.{}.cal", index)
        } else if primary.starts_with("image/") {
            format!("part.{}.img", index)
        } else if primary == "message/rfc822" {
            format!("rfc822.{}.eml", index)
        } else if primary.is_empty() || primary.starts_with("text/") || primary.starts_with("message/") {
            format!("part.{}.txt", index)
        } else {
            format!("part.{}.dat", index)
        }
    }

    /// Applies Content-Transfer-Encoding. Malformed encodings recover with
    /// the raw bytes for that part; other parts are unaffected.
    fn decode_transfer_encoding(headers: &MimeHeaders, body: Vec<u8>) -> Vec<u8> {
        let encoding = headers
            .value("Content-Transfer-Encoding")
            .map(|e| e.trim().to_lowercase())
            .unwrap_or_default();

        if encoding == "base64" {
            let cleaned: Vec<u8> = body
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            match BASE64.decode(&cleaned) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Base64 decode failed, keeping raw bytes: {}", e);
                    body
                }
            }
        } else if encoding == "quoted-printable" {
            match Self::decode_quoted_printable(&body) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("Quoted-printable decode failed, keeping raw bytes: {}", e);
                    body
                }
            }
        } else {
            // 7bit, 8bit, binary or absent.
            body
        }
    }

    fn decode_quoted_printable(content: &[u8]) -> std::result::Result<Vec<u8>, String> {
        let mut out = Vec::with_capacity(content.len());
        let mut i = 0;

        while i < content.len() {
            let b = content[i];
            if b != b'=' {
                out.push(b);
                i += 1;
                continue;
            }

            // Soft line break: `=` immediately before CRLF or LF vanishes.
            if content.get(i + 1) == Some(&b'\r') && content.get(i + 2) == Some(&b'\n') {
                i += 3;
                continue;
            }
            if content.get(i + 1) == Some(&b'\n') {
                i += 2;
                continue;
            }

            let hi = content
                .get(i + 1)
                .ok_or_else(|| "truncated escape".to_string())?;
            let lo = content
                .get(i + 2)
                .ok_or_else(|| "truncated escape".to_string())?;
            let hex = [*hi, *lo];
            let text = std::str::from_utf8(&hex).map_err(|_| "invalid escape".to_string())?;
            let byte =
                u8::from_str_radix(text, 16).map_err(|_| format!("invalid escape ={}", text))?;
            out.push(byte);
            i += 3;
        }

        Ok(out)
    }
}
