//! Failure classification for agent invocations.

use regex::Regex;
use std::sync::LazyLock;

use forgeline_common::ExecutionError;

// Signatures are checked permanent-first: a compile error that also
// mentions a timeout should not burn transient retries.
static PERMANENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(syntax ?error|parse error|unexpected token|cannot find (symbol|value|type|function|module)|unresolved (import|name|reference)|undefined (reference|symbol|variable|name)|NameError|ReferenceError|is not defined|no such (function|method)|command not found)",
    )
    .unwrap()
});

static TRANSIENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(timed? ?out|deadline exceeded|rate.?limit|too many requests|\b429\b|\b50[234]\b|overloaded|connection (reset|refused|closed|aborted)|ECONNRESET|ECONNREFUSED|broken pipe|temporar(y|ily) unavailable|service unavailable|try again later)",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// Classify the output of an agent run that reported failure.
///
/// Output matching neither signature set is permanent: the quality-gate
/// budget, not the transient budget, handles unexplained failures.
pub fn classify_output(output: &str) -> FailureClass {
    if PERMANENT_REGEX.is_match(output) {
        FailureClass::Permanent
    } else if TRANSIENT_REGEX.is_match(output) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Classify an invocation error (the agent never ran to completion).
pub fn classify_error(err: &anyhow::Error) -> FailureClass {
    let is_transient_io = err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some_and(|io| {
            matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::BrokenPipe
            )
        })
    });
    if is_transient_io {
        return FailureClass::Transient;
    }
    classify_output(&format!("{:#}", err))
}

/// Build the structured error for a classified failure.
pub fn to_execution_error(class: FailureClass, message: impl Into<String>) -> ExecutionError {
    match class {
        FailureClass::Transient => ExecutionError::transient(message),
        FailureClass::Permanent => ExecutionError::permanent(message),
    }
}
