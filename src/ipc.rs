//! Newline-delimited JSON framing for control connections.
use std::io::{self, BufRead, Write};

use crate::{error::CorralError, message::Message};

/// Reads the next message from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream. Blank lines are skipped.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<Message>, CorralError> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }

        // Bytes are decoded by serde_json so invalid UTF-8 is a codec error.
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }

        return Ok(Some(serde_json::from_slice(trimmed)?));
    }
}

/// Writes `message` followed by a newline and flushes.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), CorralError> {
    let payload = serde_json::to_vec(message)?;
    writer.write_all(&payload)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// True for errors confined to one line; the stream itself is still usable.
pub fn is_malformed(err: &CorralError) -> bool {
    match err {
        CorralError::Codec(_) => true,
        CorralError::Io(io_err) => io_err.kind() == io::ErrorKind::InvalidData,
        _ => false,
    }
}

/// True for I/O errors that just mean the peer went away.
pub fn is_disconnect(err: &CorralError) -> bool {
    match err {
        CorralError::Io(io_err) => matches!(
            io_err.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        ),
        _ => false,
    }
}
