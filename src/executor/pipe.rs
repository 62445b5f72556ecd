//! Draining of child process output.
//!
//! Backends parse what `lxc`, `docker`, `vagrant` and `terraform` print, so
//! every byte is kept. Each line is also mirrored to the log as it arrives.

use std::any::Any;
use std::fmt;
use std::io::{BufRead, BufReader, Read};

/// Which of the child's output streams a reader is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stream {
    Out,
    Err,
}

impl Stream {
    pub(super) fn label(self) -> &'static str {
        match self {
            Self::Out => "stdout",
            Self::Err => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Best-effort text of a panic payload from a joined reader thread.
pub(super) fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s;
    }
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .unwrap_or("unknown panic")
}

/// Reads `source` until EOF and returns everything it produced.
///
/// Output is never echoed to our own stdout, which carries the task result.
/// stdout lines are logged at TRACE and stderr lines at DEBUG. A read error
/// ends the drain early and keeps whatever arrived before it. Invalid UTF-8
/// is replaced rather than rejected.
pub(super) fn drain<R: Read>(source: Option<R>, stream: Stream) -> String {
    let Some(source) = source else {
        tracing::error!(%stream, "child stream was not piped");
        return String::new();
    };

    let mut reader = BufReader::new(source);
    let mut collected = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                trace_line(&line, stream);
                collected.extend_from_slice(&line);
            }
            Err(error) => {
                tracing::error!(%stream, %error, "reading child output failed");
                break;
            }
        }
    }

    String::from_utf8_lossy(&collected).into_owned()
}

fn trace_line(raw: &[u8], stream: Stream) {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    match stream {
        Stream::Out => tracing::trace!(%stream, "{text}"),
        Stream::Err => tracing::debug!(%stream, "{text}"),
    }
}
