//! Child-process execution with line-oriented output streaming.
//!
//! External tools repaint progress in place using bare `\r` (and one of them
//! emits ASCII backspace instead), so the reader works byte-wise: a line ends
//! on `\n` or `\r`, backspace is normalized to `\r`, and end-of-stream
//! flushes whatever is buffered. Undecodable bytes never abort the stream;
//! they are surfaced as a warning line carrying the hex bytes.

use std::ffi::OsStr;
use std::io::{self, BufReader, Read};
use std::process::{Command, Stdio};

use crate::error::{FingerprintError, Result};

/// Output encoding of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl OutputEncoding {
    fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => match std::str::from_utf8(bytes) {
                Ok(text) => text.to_owned(),
                Err(e) => format!("Warning: {e} - {}", hex::encode(bytes)),
            },
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Reads one line from the stream, byte-wise.
///
/// The terminator (`\n` or `\r`) is kept in the returned line. Returns
/// `Ok(None)` once the stream is exhausted.
pub fn read_output_line(
    reader: &mut impl Read,
    encoding: OutputEncoding,
) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let count = reader.read(&mut byte)?;

        if count == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            return Ok(Some(encoding.decode(&line)));
        }

        // drutil repaints with backspaces; treat them as carriage returns.
        let b = if byte[0] == 0x08 { b'\r' } else { byte[0] };
        line.push(b);

        if b == b'\r' || b == b'\n' {
            return Ok(Some(encoding.decode(&line)));
        }
    }
}

/// Runs child processes, streaming their combined stdout/stderr to a caller
/// supplied line handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Runs `program` with `args`, feeding each output line (terminator
    /// stripped) to `output`, and returns the exit code.
    ///
    /// With `fail_on_exit`, a non-zero exit code becomes
    /// [`FingerprintError::Subprocess`].
    pub fn execute<S: AsRef<OsStr>>(
        &self,
        program: &str,
        args: &[S],
        encoding: OutputEncoding,
        output: &mut dyn FnMut(&str),
        fail_on_exit: bool,
    ) -> Result<i32> {
        let (reader, writer) = io::pipe()?;
        let stderr_writer = writer.try_clone()?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .spawn()?;

        // Both write ends were moved into the child, so the reader sees EOF
        // as soon as the child closes its streams.
        let mut reader = BufReader::new(reader);

        while let Some(line) = read_output_line(&mut reader, encoding)? {
            output(line.trim_end_matches(['\r', '\n']));
        }

        let status = child.wait()?;
        let code = status.code().unwrap_or(-1);
        log::debug!("subprocess {program} terminated ({code})");

        if fail_on_exit && code != 0 {
            return Err(FingerprintError::Subprocess(code));
        }

        Ok(code)
    }
}
