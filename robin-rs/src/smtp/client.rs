//! Outbound SMTP dialog, used by the post-receipt relay step and by test
//! harnesses. Runs on the connection task only after the server side has
//! acknowledged the message.

use crate::error::{Result, RobinError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

pub struct RelayClient {
    server_addr: String,
}

impl RelayClient {
    pub fn new(server_addr: String) -> Self {
        Self { server_addr }
    }

    /// Runs one full EHLO → MAIL → RCPT → DATA → QUIT dialog.
    pub async fn send_mail(&self, from: &str, recipients: &[String], data: &[u8]) -> Result<()> {
        if recipients.is_empty() {
            return Err(RobinError::SmtpProtocol("No relay recipients".to_string()));
        }
        info!(
            "Relaying mail from {} to {} recipient(s) via {}",
            from,
            recipients.len(),
            self.server_addr
        );

        let stream = TcpStream::connect(&self.server_addr).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let greeting = Self::read_response(&mut reader, "220").await?;
        debug!("Relay greeting: {}", greeting.trim_end());

        Self::write_line(&mut writer, &format!("EHLO {}", local_hostname())).await?;
        Self::read_response(&mut reader, "250").await?;

        Self::write_line(&mut writer, &format!("MAIL FROM:<{}>", from)).await?;
        Self::read_response(&mut reader, "250").await?;

        for recipient in recipients {
            Self::write_line(&mut writer, &format!("RCPT TO:<{}>", recipient)).await?;
            Self::read_response(&mut reader, "250").await?;
        }

        Self::write_line(&mut writer, "DATA").await?;
        Self::read_response(&mut reader, "354").await?;

        writer.write_all(&dot_stuff(data)).await?;
        writer.write_all(b".\r\n").await?;
        writer.flush().await?;
        Self::read_response(&mut reader, "250").await?;

        Self::write_line(&mut writer, "QUIT").await?;
        let mut bye = String::new();
        let _ = reader.read_line(&mut bye).await;

        info!("Relay completed via {}", self.server_addr);
        Ok(())
    }

    async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        debug!("relay > {}", line);
        writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads a possibly multi-line reply and verifies the expected code.
    async fn read_response<R>(reader: &mut BufReader<R>, expected: &str) -> Result<String>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut full_response = String::new();

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(RobinError::SmtpProtocol(
                    "Relay peer closed connection".to_string(),
                ));
            }
            debug!("relay < {}", line.trim_end());
            full_response.push_str(&line);

            // A space after the code marks the final line; a dash continues.
            if line.len() >= 4 && &line[3..4] == " " {
                break;
            }
            if line.len() < 4 {
                break;
            }
        }

        if !full_response.starts_with(expected) {
            return Err(RobinError::SmtpProtocol(format!(
                "Relay expected {}, got: {}",
                expected,
                full_response.trim_end()
            )));
        }

        Ok(full_response)
    }
}

/// Dot-stuffs message data for DATA transmission: a `.` at the start of a
/// line gains a second `.`, and the output always ends with CRLF so the
/// terminating `.` stands on its own line.
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut at_line_start = true;

    for &b in data {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }

    if !out.ends_with(b"\r\n") {
        if out.ends_with(b"\n") {
            out.pop();
            out.extend_from_slice(b"\r\n");
        } else {
            out.extend_from_slice(b"\r\n");
        }
    }

    out
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_stuff_leading_dots() {
        let stuffed = dot_stuff(b"one\r\n.two\r\nthree\r\n");
        assert_eq!(stuffed, b"one\r\n..two\r\nthree\r\n");
    }

    #[test]
    fn test_dot_stuff_first_byte() {
        let stuffed = dot_stuff(b".starts with dot\r\n");
        assert_eq!(stuffed, b"..starts with dot\r\n");
    }

    #[test]
    fn test_dot_stuff_terminates_with_crlf() {
        assert_eq!(dot_stuff(b"no newline"), b"no newline\r\n");
        assert_eq!(dot_stuff(b"bare lf\n"), b"bare lf\r\n");
        assert_eq!(dot_stuff(b"crlf\r\n"), b"crlf\r\n");
    }

    #[test]
    fn test_client_creation() {
        let client = RelayClient::new("mail.example.com:25".to_string());
        assert_eq!(client.server_addr, "mail.example.com:25");
    }
}
