// diag.rs — Unified diagnostics model
//
// Shared diagnostic types used across all lowering stages. The program
// representation carries no source text, so diagnostics anchor to the
// arena node that triggered them instead of a source span.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::NodeId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`, `W0302`).
///
/// Codes are `&'static str` constants defined in the `codes` module. Once
/// assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable codes for every diagnostic the lowering emits.
pub mod codes {
    use super::DiagCode;

    /// Unknown target device name.
    pub const E0100: DiagCode = DiagCode("E0100");
    /// Segment mixes memory-copy and named-channel transfer styles.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// Pipeline handoff payload cannot be placed in device memory.
    pub const E0300: DiagCode = DiagCode("E0300");
    /// Conditional guard not resolvable to a constant for this tile.
    pub const W0301: DiagCode = DiagCode("W0301");
    /// Channel shape unsupported by queue lowering; left unlowered.
    pub const W0302: DiagCode = DiagCode("W0302");
    /// Shim column pool exhausted.
    pub const E0401: DiagCode = DiagCode("E0401");
    /// Transfer shape is invalid: non-constant length, unsupported
    /// memory hop, or an endpoint that is not a placed buffer.
    pub const E0402: DiagCode = DiagCode("E0402");
    /// Per-tile lock id space exhausted.
    pub const E0403: DiagCode = DiagCode("E0403");
    /// Outline verification failed.
    pub const E0600: DiagCode = DiagCode("E0600");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A diagnostic emitted by any lowering stage.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    /// Arena node the diagnostic refers to, if any.
    pub node: Option<NodeId>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, node, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            node: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the node the diagnostic refers to.
    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(node) = &self.node {
            write!(f, " (at {})", node)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is error-level.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}
