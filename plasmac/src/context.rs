//! Source contexts.
//!
//! The front-end attaches a context to every core-IR expression; the
//! type checker copies it onto the constraint literals it posts, so a
//! failing literal can point back at the line that produced it.

use serde::{Deserialize, Serialize};

/// A source position: a file and line, a bare line, or nothing at all for
/// synthesised code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Context {
    #[default]
    Nil,
    Line(u32),
    FileLine(String, u32),
}

impl Context {
    pub fn line(&self) -> Option<u32> {
        match self {
            Context::Nil => None,
            Context::Line(line) => Some(*line),
            Context::FileLine(_, line) => Some(*line),
        }
    }

    pub fn file(&self) -> Option<&str> {
        match self {
            Context::FileLine(file, _) => Some(file),
            _ => None,
        }
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Context::Nil => write!(f, "<unknown>"),
            Context::Line(line) => write!(f, "line {line}"),
            Context::FileLine(file, line) => write!(f, "{file}:{line}"),
        }
    }
}

/// A precomputed index of line start positions for line/span lookup.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte offsets where each line starts; line 1 starts at byte 0.
    line_starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    /// Build a line index from source code. O(n) one-time cost.
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (offset, ch) in source.char_indices() {
            if ch == '\n' {
                line_starts.push(offset + 1);
            }
        }
        Self {
            line_starts,
            len: source.len(),
        }
    }

    /// The byte range of a 1-indexed line, without its newline.
    pub fn line_range(&self, line: u32) -> std::ops::Range<usize> {
        let index = (line.saturating_sub(1)) as usize;
        let start = self.line_starts.get(index).copied().unwrap_or(self.len);
        let end = self
            .line_starts
            .get(index + 1)
            .map(|next| next.saturating_sub(1))
            .unwrap_or(self.len);
        start..end.max(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_accessors() {
        assert_eq!(Context::Nil.line(), None);
        assert_eq!(Context::Line(3).line(), Some(3));
        let ctx = Context::FileLine("main.p".into(), 7);
        assert_eq!(ctx.line(), Some(7));
        assert_eq!(ctx.file(), Some("main.p"));
        assert_eq!(ctx.to_string(), "main.p:7");
    }

    #[test]
    fn test_line_ranges() {
        let source = "func main() {\n    print!(\"hi\")\n}\n";
        let index = LineIndex::new(source);
        assert_eq!(&source[index.line_range(1)], "func main() {");
        assert_eq!(&source[index.line_range(2)], "    print!(\"hi\")");
        assert_eq!(&source[index.line_range(3)], "}");
    }

    #[test]
    fn test_line_range_out_of_bounds() {
        let index = LineIndex::new("one line");
        let range = index.line_range(99);
        assert!(range.is_empty());
    }
}
