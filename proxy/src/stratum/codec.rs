//! Line framing for Stratum connections.
//!
//! Each frame is one UTF-8 JSON object terminated by `\n`. The reader caps
//! frames at [`MAX_LINE_BYTES`] while buffering, so a peer cannot grow the
//! buffer without bound before the terminator arrives.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::protocol::MAX_LINE_BYTES;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds {MAX_LINE_BYTES} bytes")]
    Oversize,
    #[error("frame is not valid UTF-8")]
    Utf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read the next line. `Ok(None)` means clean EOF; an unterminated trailing
/// fragment at EOF is not a frame. The returned line is trimmed.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(None);
        }

        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if buf.len() + pos > MAX_LINE_BYTES {
                    reader.consume(pos + 1);
                    return Err(FrameError::Oversize);
                }
                buf.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                let line = std::str::from_utf8(buf).map_err(|_| FrameError::Utf8)?;
                return Ok(Some(line.trim().to_string()));
            }
            None => {
                let len = available.len();
                if buf.len() + len > MAX_LINE_BYTES {
                    reader.consume(len);
                    return Err(FrameError::Oversize);
                }
                buf.extend_from_slice(available);
                reader.consume(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_lines_and_eof() {
        let data = b"{\"id\":1}\n{\"id\":2}\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let mut buf = Vec::new();

        assert_eq!(read_frame(&mut reader, &mut buf).await.unwrap().unwrap(), "{\"id\":1}");
        assert_eq!(read_frame(&mut reader, &mut buf).await.unwrap().unwrap(), "{\"id\":2}");
        assert!(read_frame(&mut reader, &mut buf).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trims_carriage_return() {
        let mut reader = BufReader::new(std::io::Cursor::new(b"{\"id\":1}\r\n".to_vec()));
        let mut buf = Vec::new();
        assert_eq!(read_frame(&mut reader, &mut buf).await.unwrap().unwrap(), "{\"id\":1}");
    }

    #[tokio::test]
    async fn rejects_oversized_line() {
        let mut data = vec![b'x'; MAX_LINE_BYTES + 1];
        data.push(b'\n');
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let mut buf = Vec::new();
        assert!(matches!(
            read_frame(&mut reader, &mut buf).await,
            Err(FrameError::Oversize)
        ));
    }

    #[tokio::test]
    async fn unterminated_fragment_is_not_a_frame() {
        let mut reader = BufReader::new(std::io::Cursor::new(b"{\"id\":1}".to_vec()));
        let mut buf = Vec::new();
        assert!(read_frame(&mut reader, &mut buf).await.unwrap().is_none());
    }
}
