use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Raw SMTP client for driving the server from the wire side.
pub struct SmtpTestClient {
    stream: BufReader<TcpStream>,
}

impl SmtpTestClient {
    /// Connects and consumes the 220 banner.
    pub async fn connect(addr: SocketAddr) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| format!("Failed to connect: {}", e))?;
        let mut client = Self {
            stream: BufReader::new(stream),
        };

        let greeting = client.read_response().await?;
        if !greeting.starts_with("220") {
            return Err(format!("Unexpected greeting: {}", greeting));
        }
        Ok(client)
    }

    pub async fn command(&mut self, line: &str) -> Result<String, String> {
        self.send_line(line).await?;
        self.read_response().await
    }

    /// Sends DATA, the content, and the terminating dot.
    pub async fn data(&mut self, content: &str) -> Result<String, String> {
        let response = self.command("DATA").await?;
        if !response.starts_with("354") {
            return Ok(response);
        }
        for line in content.split("\r\n") {
            self.send_line(line).await?;
        }
        self.command(".").await
    }

    pub async fn quit(mut self) -> Result<String, String> {
        self.command("QUIT").await
    }

    /// Raw byte write, used by the BDAT tests.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), String> {
        self.stream
            .get_mut()
            .write_all(bytes)
            .await
            .map_err(|e| format!("Failed to write: {}", e))?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| format!("Failed to flush: {}", e))
    }

    pub async fn send_line(&mut self, line: &str) -> Result<(), String> {
        self.send_bytes(format!("{}\r\n", line).as_bytes()).await
    }

    pub async fn read_response(&mut self) -> Result<String, String> {
        read_response_from(&mut self.stream).await
    }

    /// Hands back the raw stream, e.g. for a TLS handshake after STARTTLS.
    pub fn into_inner(self) -> TcpStream {
        self.stream.into_inner()
    }
}

/// Reads one (possibly multi-line) reply: `NNN-` continues, `NNN ` ends.
pub async fn read_response_from<S>(reader: &mut BufReader<S>) -> Result<String, String>
where
    S: AsyncRead + Unpin,
{
    let mut full_response = String::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| format!("Failed to read: {}", e))?;
        if n == 0 {
            if full_response.is_empty() {
                return Err("Connection closed".to_string());
            }
            break;
        }
        full_response.push_str(&line);
        if line.len() >= 4 && line.as_bytes()[3] == b' ' {
            break;
        }
        if line.len() < 4 {
            break;
        }
    }
    Ok(full_response.trim_end().to_string())
}

pub async fn send_line_to<S>(stream: &mut S, line: &str) -> Result<(), String>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(format!("{}\r\n", line).as_bytes())
        .await
        .map_err(|e| format!("Failed to write: {}", e))?;
    stream.flush().await.map_err(|e| format!("Failed to flush: {}", e))
}
