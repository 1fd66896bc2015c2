//! Bounded capture of child output streams

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Bytes captured from one stream, up to a cap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    /// More bytes were produced than were kept
    pub truncated: bool,
}

impl CapturedOutput {
    /// True when nothing but whitespace was captured
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(|b| b.is_ascii_whitespace())
    }

    /// Lossy UTF-8 text, with a marker line when truncated
    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes.
///
/// Bytes past the cap are still read and discarded so the writer never
/// blocks on a full pipe.
pub async fn read_bounded<R>(mut reader: R, cap: usize) -> io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut out = CapturedOutput {
        bytes: Vec::with_capacity(cap.min(READ_CHUNK)),
        truncated: false,
    };
    let mut buf = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(out.bytes.len());
        let keep = n.min(room);
        out.bytes.extend_from_slice(&buf[..keep]);
        if keep < n {
            out.truncated = true;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_under_cap() {
        let data: &[u8] = b"line 10: syntax error";
        let out = read_bounded(data, 1024).await.unwrap();
        assert_eq!(out.bytes, data);
        assert!(!out.truncated);
        assert_eq!(out.to_text(), "line 10: syntax error");
    }

    #[tokio::test]
    async fn test_read_exactly_cap_is_not_truncated() {
        let data = vec![b'x'; 64];
        let out = read_bounded(&data[..], 64).await.unwrap();
        assert_eq!(out.bytes.len(), 64);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_read_over_cap_truncates() {
        let data = vec![b'e'; 100_000];
        let out = read_bounded(&data[..], 1000).await.unwrap();
        assert_eq!(out.bytes.len(), 1000);
        assert!(out.truncated);
        assert!(out.to_text().ends_with("[output truncated]"));
    }

    #[test]
    fn test_blank_detection() {
        let out = CapturedOutput {
            bytes: b" \n\t".to_vec(),
            truncated: false,
        };
        assert!(out.is_blank());
        assert!(CapturedOutput::default().is_blank());

        let out = CapturedOutput {
            bytes: b"error".to_vec(),
            truncated: false,
        };
        assert!(!out.is_blank());
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let out = CapturedOutput {
            bytes: vec![b'o', b'k', 0xff],
            truncated: false,
        };
        assert_eq!(out.to_text(), "ok\u{fffd}");
    }
}
