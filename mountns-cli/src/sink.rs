//! Report sinks for the command line

use std::io::Write;

use mountns_core::{CaseReport, ResultSink};

/// Prints one line per case and logs it
pub struct ConsoleSink<W: Write> {
    writer: W,
}

impl<W: Write> ConsoleSink<W> {
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> ResultSink for ConsoleSink<W> {
    fn report(&mut self, report: &CaseReport) {
        report.emit_trace();
        if let Err(e) = writeln!(self.writer, "{report}") {
            tracing::warn!(error = %e, "Failed to write report");
        }
    }
}

/// Writes one JSON object per case and line
pub struct JsonSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonSink<W> {
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ResultSink for JsonSink<W> {
    fn report(&mut self, report: &CaseReport) {
        report.emit_trace();
        let written = serde_json::to_writer(&mut self.writer, report)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(self.writer))
            .and_then(|()| self.writer.flush());

        if let Err(e) = written {
            tracing::warn!(error = %e, case = %report.case, "Failed to write JSON report");
        }
    }
}
