//! Diagnostic rendering for compile errors.
//!
//! Type errors carry `(file, line)` contexts rather than byte spans; the
//! emitter resolves a context's line against the caller's source text to
//! produce a pretty report.

use ariadne::{Color, Label, Report, ReportKind, Source};

use crate::context::LineIndex;
use crate::typeck::error::TypeError;

/// Renders compile errors against a single source file.
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
    line_index: LineIndex,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self {
            filename,
            source,
            line_index: LineIndex::new(source),
        }
    }

    /// Emit one type error to stderr.
    pub fn emit(&self, error: &TypeError) {
        self.write(error, &mut std::io::stderr());
    }

    /// Emit into any writer; the test hook.
    pub fn write(&self, error: &TypeError, out: &mut dyn std::io::Write) {
        let span = error
            .context()
            .and_then(|context| context.line())
            .map(|line| self.line_index.line_range(line))
            .unwrap_or(0..0);

        let mut builder = Report::build(ReportKind::Error, self.filename, span.start)
            .with_message(error.to_string());
        builder = builder.with_label(
            Label::new((self.filename, span))
                .with_color(Color::Red)
                .with_message(error.to_string()),
        );

        if let TypeError::Flounder { remaining, .. } = error {
            if !remaining.is_empty() {
                builder = builder.with_help(format!(
                    "constraints left unsolved:\n{}",
                    remaining.join("\n")
                ));
            }
        }

        let report = builder.finish();
        let mut rendered = Vec::new();
        report
            .write((self.filename, Source::from(self.source)), &mut rendered)
            .expect("diagnostic rendering failed");
        let _ = out.write_all(&rendered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn test_emit_points_at_context_line() {
        let source = "func f() {\n    let x = bad\n}\n";
        let emitter = DiagnosticEmitter::new("f.p", source);
        let error = TypeError::Mismatch {
            reason: "type mismatch: Int vs String".to_string(),
            context: Context::FileLine("f.p".into(), 2),
        };
        let mut rendered = Vec::new();
        emitter.write(&error, &mut rendered);
        let text = String::from_utf8_lossy(&rendered);
        assert!(text.contains("type mismatch"));
    }
}
