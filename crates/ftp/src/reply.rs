//! Control channel replies.
//!
//! A reply is a three-digit code followed by text. Multi-line replies open
//! with `123-first line` and close with `123 last line`; intermediate lines
//! are free-form.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_LINE_LEN;
use crate::error::FtpError;

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Reply text with lines joined by `\n`.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// 1xx: action started, another reply follows.
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx: action completed.
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx: more information required (e.g. password).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// 4xx: transient failure.
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// 5xx: permanent failure.
    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }

    /// Serializes the reply in wire form, CRLF-terminated.
    pub fn encode(&self) -> String {
        let code = self.code;
        match self.lines.as_slice() {
            [] => format!("{code} \r\n"),
            [only] => format!("{code} {only}\r\n"),
            [first, middle @ .., last] => {
                let mut out = format!("{code}-{first}\r\n");
                for line in middle {
                    // Continuation lines must not look like a terminator.
                    if line.starts_with(|c: char| c.is_ascii_digit()) {
                        out.push(' ');
                    }
                    out.push_str(line);
                    out.push_str("\r\n");
                }
                out.push_str(&format!("{code} {last}\r\n"));
                out
            }
        }
    }
}

/// Reads one CRLF- or LF-terminated line, without the terminator.
///
/// Returns `None` on a clean EOF before any bytes.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, FtpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_LEN {
            return Err(FtpError::Protocol("control line too long".into()));
        }
        return Err(FtpError::Protocol("connection closed mid-line".into()));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| FtpError::Protocol("control line is not UTF-8".into()))
}

fn parse_code(line: &str) -> Option<(u16, u8)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = line[..3].parse().ok()?;
    let sep = bytes.get(3).copied().unwrap_or(b' ');
    Some((code, sep))
}

/// Reads a complete (possibly multi-line) reply.
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, FtpError>
where
    R: AsyncBufRead + Unpin,
{
    let first = read_line(reader)
        .await?
        .ok_or_else(|| FtpError::Protocol("connection closed while awaiting reply".into()))?;
    let (code, sep) = parse_code(&first)
        .ok_or_else(|| FtpError::Protocol(format!("malformed reply: {first:?}")))?;
    let text = first.get(4..).unwrap_or("").to_string();

    if sep != b'-' {
        return Ok(Reply::new(code, text));
    }

    let mut lines = vec![text];
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| FtpError::Protocol("connection closed inside multi-line reply".into()))?;
        if let Some((c, b' ')) = parse_code(&line)
            && c == code
        {
            lines.push(line.get(4..).unwrap_or("").to_string());
            return Ok(Reply::multiline(code, lines));
        }
        lines.push(line.trim_start().to_string());
    }
}

/// Writes a reply and flushes it.
pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), FtpError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply.encode().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> Result<Reply, FtpError> {
        let mut reader = BufReader::new(raw.as_bytes());
        read_reply(&mut reader).await
    }

    #[tokio::test]
    async fn single_line_reply() {
        let reply = parse("220 ferry ready\r\n").await.unwrap();
        assert_eq!(reply.code, 220);
        assert_eq!(reply.text(), "ferry ready");
        assert!(reply.is_completion());
    }

    #[tokio::test]
    async fn multi_line_reply() {
        let raw = "211-Features:\r\n PASV\r\n SIZE\r\n211 End\r\n";
        let reply = parse(raw).await.unwrap();
        assert_eq!(reply.code, 211);
        assert_eq!(reply.lines, vec!["Features:", "PASV", "SIZE", "End"]);
    }

    #[tokio::test]
    async fn multi_line_ignores_other_codes() {
        let raw = "230-Welcome\r\n230-still going\r\n123 not the end\r\n230 done\r\n";
        let reply = parse(raw).await.unwrap();
        assert_eq!(reply.code, 230);
        assert_eq!(reply.lines.len(), 4);
        assert_eq!(reply.lines.last().unwrap(), "done");
    }

    #[tokio::test]
    async fn bare_lf_is_accepted() {
        let reply = parse("200 ok\n").await.unwrap();
        assert_eq!(reply, Reply::new(200, "ok"));
    }

    #[tokio::test]
    async fn malformed_reply_is_rejected() {
        assert!(matches!(parse("hello\r\n").await, Err(FtpError::Protocol(_))));
        assert!(matches!(parse("").await, Err(FtpError::Protocol(_))));
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let raw = format!("200 {}\r\n", "x".repeat(MAX_LINE_LEN + 10));
        assert!(matches!(parse(&raw).await, Err(FtpError::Protocol(_))));
    }

    #[tokio::test]
    async fn encode_then_read_multiline() {
        let reply = Reply::multiline(
            211,
            vec!["Features:".into(), "AUTH TLS".into(), "End".into()],
        );
        let encoded = reply.encode();
        assert!(encoded.starts_with("211-Features:\r\n"));
        assert!(encoded.ends_with("211 End\r\n"));
        assert_eq!(parse(&encoded).await.unwrap(), reply);
    }

    #[test]
    fn reply_classes() {
        assert!(Reply::new(150, "").is_preliminary());
        assert!(Reply::new(331, "").is_intermediate());
        assert!(Reply::new(425, "").is_transient());
        assert!(Reply::new(553, "").is_permanent());
    }
}
