//! Public exception type surfaced to the host.
//!
//! [`Exception`] is the structured error a run produces: kind, message, the
//! traceback chain, and the cause/context links. Its `Display` renders the
//! guest-conventional traceback text — frames outermost first, connector
//! lines between chained exceptions, and the quoted source line when the
//! front-end attached source text.

use std::fmt;

use serde::{Deserialize, Serialize};

pub use crate::exc::ExcKind;
use crate::{
    exc::{ExcPayload, RawFrame},
    intern::Interns,
};

/// One rendered traceback frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    /// Source identifier (filename-like).
    pub source: String,
    /// 1-based line number.
    pub line: u32,
    /// Function qualified name, or `<module>` for top-level code.
    pub function: String,
    /// Trimmed text of the source line, when available.
    pub source_line: Option<String>,
}

/// A structured guest error returned to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exception {
    /// Builtin kind this exception matches.
    pub kind: ExcKind,
    /// Guest-defined class name, when raised from a user class.
    pub class_name: Option<String>,
    /// The exception message, if any.
    pub message: Option<String>,
    /// Traceback frames, innermost (raising) frame first.
    pub frames: Vec<StackFrame>,
    /// Explicit `raise ... from` cause.
    pub cause: Option<Box<Exception>>,
    /// Implicit during-handling context.
    pub context: Option<Box<Exception>>,
    /// Whether the implicit context line is suppressed.
    pub suppress_context: bool,
    /// Member exceptions when `kind` is `ExceptionGroup`.
    pub group: Vec<Exception>,
}

impl Exception {
    /// The guest-visible class name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.class_name.as_deref().unwrap_or_else(|| self.kind.into())
    }

    /// Convenience constructor used by tests and hosts that synthesize
    /// errors (e.g. injecting a failure into a suspended call).
    #[must_use]
    pub fn new(kind: ExcKind, message: impl Into<Option<String>>) -> Self {
        Self {
            kind,
            class_name: None,
            message: message.into(),
            frames: Vec::new(),
            cause: None,
            context: None,
            suppress_context: false,
            group: Vec::new(),
        }
    }

    /// Resolves an internal payload into the public form.
    ///
    /// `line_text` maps `(source identifier, line)` to quoted source text;
    /// the runner wires it to the code objects that carry source.
    pub(crate) fn from_payload(
        payload: &ExcPayload,
        interns: &Interns,
        line_text: &dyn Fn(&str, u32) -> Option<String>,
    ) -> Self {
        let frames = payload
            .frames
            .iter()
            .map(|raw| Self::resolve_frame(raw, interns, line_text))
            .collect();
        Self {
            kind: payload.kind,
            class_name: payload.class_name.clone(),
            message: payload.message.clone(),
            frames,
            cause: payload
                .cause
                .as_deref()
                .map(|c| Box::new(Self::from_payload(c, interns, line_text))),
            context: payload
                .context
                .as_deref()
                .map(|c| Box::new(Self::from_payload(c, interns, line_text))),
            suppress_context: payload.suppress_context,
            group: payload
                .group
                .iter()
                .map(|m| Self::from_payload(m, interns, line_text))
                .collect(),
        }
    }

    fn resolve_frame(raw: &RawFrame, interns: &Interns, line_text: &dyn Fn(&str, u32) -> Option<String>) -> StackFrame {
        let source = interns.get_str(raw.source_id).to_owned();
        let source_line = line_text(&source, raw.line);
        StackFrame {
            source,
            line: raw.line,
            function: interns.get_str(raw.func_id).to_owned(),
            source_line,
        }
    }

    /// Renders the headline `Kind: message` (or bare `Kind`) line.
    fn fmt_headline(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) if !msg.is_empty() => write!(f, "{}: {msg}", self.type_name()),
            _ => write!(f, "{}", self.type_name()),
        }
    }

    fn fmt_traceback(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Chained exceptions render first: the oldest link appears at the
        // top, exactly like the guest language prints them.
        if let Some(cause) = &self.cause {
            cause.fmt_traceback(f)?;
            writeln!(f)?;
            writeln!(
                f,
                "The above exception was the direct cause of the following exception:"
            )?;
            writeln!(f)?;
        } else if let Some(context) = &self.context
            && !self.suppress_context
        {
            context.fmt_traceback(f)?;
            writeln!(f)?;
            writeln!(
                f,
                "During handling of the above exception, another exception occurred:"
            )?;
            writeln!(f)?;
        }

        if !self.frames.is_empty() {
            writeln!(f, "Traceback (most recent call last):")?;
            // Stored innermost-first; rendered outermost-first.
            for frame in self.frames.iter().rev() {
                writeln!(
                    f,
                    "  File \"{}\", line {}, in {}",
                    frame.source, frame.line, frame.function
                )?;
                if let Some(text) = &frame.source_line {
                    writeln!(f, "    {text}")?;
                }
            }
        }
        self.fmt_headline(f)?;
        writeln!(f)?;

        for (index, member) in self.group.iter().enumerate() {
            writeln!(f, "  +-- sub-exception #{}:", index + 1)?;
            let rendered = member.to_string();
            for line in rendered.lines() {
                writeln!(f, "  |   {line}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_traceback(f)
    }
}

impl std::error::Error for Exception {}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn frame(source: &str, line: u32, function: &str, text: Option<&str>) -> StackFrame {
        StackFrame {
            source: source.to_owned(),
            line,
            function: function.to_owned(),
            source_line: text.map(str::to_owned),
        }
    }

    #[test]
    fn renders_frames_outermost_first() {
        let exc = Exception {
            frames: vec![
                frame("test.py", 2, "foo", Some("1 / 0")),
                frame("test.py", 4, "<module>", Some("foo()")),
            ],
            ..Exception::new(ExcKind::ZeroDivisionError, Some("division by zero".to_owned()))
        };
        let rendered = exc.to_string();
        assert_eq!(
            rendered,
            "Traceback (most recent call last):\n  File \"test.py\", line 4, in <module>\n    foo()\n  File \"test.py\", line 2, in foo\n    1 / 0\nZeroDivisionError: division by zero\n"
        );
    }

    #[test]
    fn context_connector_appears_unless_suppressed() {
        let mut exc = Exception::new(ExcKind::TypeError, Some("bad".to_owned()));
        exc.context = Some(Box::new(Exception::new(
            ExcKind::ValueError,
            Some("first".to_owned()),
        )));
        assert!(exc.to_string().contains("During handling of the above exception"));

        exc.suppress_context = true;
        assert!(!exc.to_string().contains("During handling"));
    }

    #[test]
    fn cause_connector_wins_over_context() {
        let mut exc = Exception::new(ExcKind::TypeError, None);
        exc.cause = Some(Box::new(Exception::new(ExcKind::ValueError, None)));
        exc.context = Some(Box::new(Exception::new(ExcKind::KeyError, None)));
        exc.suppress_context = true;
        let rendered = exc.to_string();
        assert!(rendered.contains("direct cause"));
        assert!(!rendered.contains("KeyError"));
    }
}
