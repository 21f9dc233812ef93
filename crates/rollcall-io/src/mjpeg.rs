//! MJPEG (`multipart/x-mixed-replace`) frame source.
//!
//! Each part is a JPEG, optionally preceded by a `Content-Length` header.
//! Parts without one are delimited by the JPEG end-of-image marker.

use rollcall_core::frame::Frame;
use rollcall_core::pipeline::{FrameSource, StreamError};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::time::Duration;

/// Upper bound for a single part; a larger one means the stream is corrupt.
const MAX_PART_BYTES: usize = 16 * 1024 * 1024;
/// Upper bound for a boundary or header line.
const MAX_LINE_BYTES: usize = 8 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

pub struct MjpegSource<R> {
    reader: R,
    marker: String,
    sequence: u64,
}

impl MjpegSource<BufReader<reqwest::blocking::Response>> {
    /// Open an MJPEG stream over HTTP.
    ///
    /// Uses the blocking client, so this must not run on an async runtime
    /// thread.
    pub fn connect(url: &str) -> Result<Self, StreamError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| StreamError::Open(format!("http client: {e}")))?;

        let response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| StreamError::Open(format!("{url}: {e}")))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let boundary = boundary_from_content_type(&content_type).ok_or_else(|| {
            StreamError::Open(format!("{url}: not an MJPEG stream (content-type {content_type:?})"))
        })?;

        tracing::info!(url, boundary = %boundary, "MJPEG stream opened");
        Ok(Self::from_reader(BufReader::new(response), &boundary))
    }
}

impl<R: BufRead> MjpegSource<R> {
    /// Parse an already-open multipart body separated by `boundary`
    /// (with or without the leading `--`).
    pub fn from_reader(reader: R, boundary: &str) -> Self {
        Self {
            reader,
            marker: format!("--{}", boundary.trim_start_matches("--")),
            sequence: 0,
        }
    }

    /// Frames decoded so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Advance to the next part. `None` at end of stream or close delimiter.
    fn next_part(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if !line.starts_with(&self.marker) {
                continue;
            }
            if line[self.marker.len()..].starts_with("--") {
                tracing::debug!("MJPEG close delimiter received");
                return Ok(None);
            }
            break;
        }

        let mut content_length = None;
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse::<usize>().ok();
                }
            }
        }

        match content_length {
            Some(len) if len > MAX_PART_BYTES => Err(StreamError::Read(format!(
                "part of {len} bytes exceeds {MAX_PART_BYTES}"
            ))),
            Some(len) => self.read_exact_part(len),
            None => self.read_until_eoi(),
        }
    }

    fn read_exact_part(&mut self, len: usize) -> Result<Option<Vec<u8>>, StreamError> {
        let mut body = vec![0u8; len];
        match self.reader.read_exact(&mut body) {
            Ok(()) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!(expected = len, "MJPEG stream ended mid-part");
                Ok(None)
            }
            Err(e) => Err(StreamError::Read(e.to_string())),
        }
    }

    fn read_until_eoi(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        let mut body = Vec::new();
        loop {
            let n = self
                .reader
                .read_until(JPEG_EOI[1], &mut body)
                .map_err(|e| StreamError::Read(e.to_string()))?;
            if n == 0 {
                tracing::warn!(read = body.len(), "MJPEG stream ended mid-part");
                return Ok(None);
            }
            if body.ends_with(&JPEG_EOI) {
                return Ok(Some(body));
            }
            if body.len() > MAX_PART_BYTES {
                return Err(StreamError::Read(format!(
                    "no end-of-image marker within {MAX_PART_BYTES} bytes"
                )));
            }
        }
    }

    /// One header line without its line terminator; `None` at EOF.
    fn read_line(&mut self) -> Result<Option<String>, StreamError> {
        let mut raw = Vec::new();
        let n = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut raw)
            .map_err(|e| StreamError::Read(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_LINE_BYTES && raw.last() != Some(&b'\n') {
            return Err(StreamError::Read(format!(
                "no line break within {MAX_LINE_BYTES} bytes"
            )));
        }
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }
}

impl<R: BufRead> FrameSource for MjpegSource<R> {
    fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        let Some(body) = self.next_part()? else {
            return Ok(None);
        };
        let frame = Frame::decode(&body, self.sequence + 1)?;
        self.sequence = frame.sequence;
        Ok(Some(frame))
    }
}

/// Extract the boundary parameter of a `multipart/x-mixed-replace` type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/x-mixed-replace") {
        return None;
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 120, 150])))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    /// Body laid out the way the collector writes it.
    fn part(body: &[u8], with_length: bool) -> Vec<u8> {
        let mut out = b"--frame\r\nContent-Type: image/jpeg\r\n".to_vec();
        if with_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    fn source(bytes: Vec<u8>) -> MjpegSource<Cursor<Vec<u8>>> {
        MjpegSource::from_reader(Cursor::new(bytes), "frame")
    }

    #[test]
    fn test_reads_parts_with_content_length() {
        let mut stream = part(&jpeg(16, 8), true);
        stream.extend(part(&jpeg(16, 8), true));
        let mut src = source(stream);

        let first = src.next_frame().unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!((first.width(), first.height()), (16, 8));
        assert_eq!(src.next_frame().unwrap().unwrap().sequence, 2);
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_reads_parts_without_content_length() {
        let mut stream = b"preamble junk\r\n".to_vec();
        stream.extend(part(&jpeg(8, 8), false));
        stream.extend(part(&jpeg(8, 8), false));
        let mut src = source(stream);

        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_none());
        assert_eq!(src.sequence(), 2);
    }

    #[test]
    fn test_corrupt_part_is_soft_and_not_counted() {
        let mut stream = part(&[0xFF, 0xD8, 0x00, 0x11, 0x22], true);
        stream.extend(part(&jpeg(8, 8), true));
        let mut src = source(stream);

        let err = src.next_frame().unwrap_err();
        assert!(err.is_soft());
        assert_eq!(src.next_frame().unwrap().unwrap().sequence, 1);
    }

    #[test]
    fn test_close_delimiter_ends_stream() {
        let mut stream = part(&jpeg(8, 8), true);
        stream.extend_from_slice(b"--frame--\r\n");
        stream.extend(part(&jpeg(8, 8), true));
        let mut src = source(stream);

        assert!(src.next_frame().unwrap().is_some());
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_truncated_part_ends_stream() {
        let body = jpeg(8, 8);
        let mut stream = part(&body, true);
        stream.truncate(stream.len() - body.len() / 2);
        let mut src = source(stream);
        assert!(src.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_overlong_header_line_is_read_error() {
        let mut stream = vec![b'x'; MAX_LINE_BYTES * 4];
        stream.extend(part(&jpeg(8, 8), true));
        let mut src = source(stream);

        let err = src.next_frame().unwrap_err();
        assert!(matches!(err, StreamError::Read(_)));
        assert!(!err.is_soft());
    }

    #[test]
    fn test_header_line_at_limit_is_accepted() {
        let mut stream = vec![b'x'; MAX_LINE_BYTES - 1];
        stream.push(b'\n');
        stream.extend(part(&jpeg(8, 8), true));
        let mut src = source(stream);
        assert_eq!(src.next_frame().unwrap().unwrap().sequence, 1);
    }

    #[test]
    fn test_boundary_with_dashes_accepted() {
        let src = MjpegSource::from_reader(Cursor::new(Vec::new()), "--frame");
        assert_eq!(src.marker, "--frame");
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/x-mixed-replace; boundary=frame").as_deref(),
            Some("frame")
        );
        assert_eq!(
            boundary_from_content_type("Multipart/X-Mixed-Replace;Boundary=\"abc\"").as_deref(),
            Some("abc")
        );
        assert_eq!(boundary_from_content_type("image/jpeg"), None);
        assert_eq!(boundary_from_content_type("multipart/x-mixed-replace"), None);
    }
}
