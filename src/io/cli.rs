//! Terminal-facing source and sinks.

use crate::format::AudioFormat;
use crate::stage::{Chunk, Produce, StageCx};
use std::io::{BufRead, Write};
use tracing::warn;

/// Reads text lines from a reader (normally stdin).
///
/// Ends on EOF or on a `quit`/`exit` line. Each line becomes one text
/// chunk without the newline.
pub struct CliTextSource<R: BufRead + Send> {
    reader: R,
}

impl<R: BufRead + Send> CliTextSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl CliTextSource<std::io::BufReader<std::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()))
    }
}

impl<R: BufRead + Send> Produce for CliTextSource<R> {
    fn output_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::text())
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        loop {
            if cx.cancelled() {
                return None;
            }
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    match trimmed {
                        "quit" | "exit" => return None,
                        "" => continue,
                        _ => return Some(trimmed.as_bytes().to_vec()),
                    }
                }
                Err(err) => {
                    warn!(stage = cx.stage_id(), %err, "stdin read failed");
                    return None;
                }
            }
        }
    }
}

/// Prints upstream text chunks as lines.
pub struct CliTextSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> CliTextSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl CliTextSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Produce for CliTextSink<W> {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::text())
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        let chunk = cx.pull()?;
        if self
            .writer
            .write_all(&chunk)
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush())
            .is_err()
        {
            return None;
        }
        Some(chunk)
    }
}

/// Writes raw upstream bytes to a writer, typically stdout piped into
/// an external player. Declares no format so anything can feed it.
pub struct CliRawSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> CliRawSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl CliRawSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> Produce for CliRawSink<W> {
    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        let chunk = cx.pull()?;
        if self.writer.write_all(&chunk).is_err() {
            return None;
        }
        Some(chunk)
    }
}
