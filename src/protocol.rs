//! Line-oriented wire protocol shared by the server and its clients.
//!
//! Requests and responses are LF-terminated text lines; a preceding CR is
//! stripped. Streaming bodies are count-prefixed opaque byte runs read and
//! written with `read_exact`/`write_all` directly on the stream.

use anyhow::{bail, Result};
use std::io::{Read, Write};

pub const DEFAULT_PORT: u16 = 5051;

/// Chunk size shared by the upload and download loops.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Resumed transfers persist their checkpoint offset every this many chunks.
pub const CHECKPOINT_EVERY_CHUNKS: u64 = 10;

// Longer request lines are treated as a framing error and drop the session.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Read one LF-terminated line, stripping CR bytes.
///
/// Returns `Ok(None)` on a clean EOF before the first byte of a new line.
/// EOF in the middle of a line is an error: the peer vanished mid-request.
pub fn read_line<R: Read>(r: &mut R) -> Result<Option<String>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = r.read(&mut byte)?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-line");
        }
        match byte[0] {
            b'\n' => break,
            b'\r' => {}
            b => {
                if buf.len() >= MAX_LINE_LEN {
                    bail!("request line too long");
                }
                buf.push(b);
            }
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Write one line, appending the terminating LF if the caller left it off.
pub fn send_line<W: Write>(w: &mut W, line: &str) -> Result<()> {
    w.write_all(line.as_bytes())?;
    if !line.ends_with('\n') {
        w.write_all(b"\n")?;
    }
    w.flush()?;
    Ok(())
}

/// Split a request line on runs of spaces and tabs.
pub fn split_tokens(line: &str) -> Vec<&str> {
    line.split(|c| c == ' ' || c == '\t')
        .filter(|t| !t.is_empty())
        .collect()
}

/// How a body transfer ended. Every variant carries the bytes that safely
/// reached the sink, which is what a resume checkpoint records.
pub enum BodyCopy {
    Complete(u64),
    /// The source ran dry (peer disconnect, truncated file).
    SourceClosed(u64),
    /// The sink refused bytes (peer disconnect, disk error).
    SinkFailed(u64),
}

/// Move exactly `len` bytes from `src` to `sink` in chunks, reporting each
/// landed chunk. Short counts are an outcome, not an error: the caller
/// decides whether a truncated body is recoverable.
pub fn copy_body<R: Read, W: Write>(
    src: &mut R,
    sink: &mut W,
    len: u64,
    mut on_chunk: impl FnMut(u64),
) -> BodyCopy {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = 0u64;
    while done < len {
        let want = (len - done).min(CHUNK_SIZE as u64) as usize;
        let n = match src.read(&mut buf[..want]) {
            Ok(0) => return BodyCopy::SourceClosed(done),
            Ok(n) => n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return BodyCopy::SourceClosed(done),
        };
        if sink.write_all(&buf[..n]).is_err() {
            return BodyCopy::SinkFailed(done);
        }
        done += n as u64;
        on_chunk(n as u64);
    }
    BodyCopy::Complete(done)
}
