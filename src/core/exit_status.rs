use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};

/// Value object summarising the outcome of an iteration, a chunk or a step.
///
/// An exit status is either *continuable* (there is more work) or terminal.
/// Statuses produced by successive iterations are folded together with
/// [`ExitStatus::and`], which is commutative: the result is continuable only
/// if both sides are, and it carries the code and description of the more
/// terminal side.
///
/// # Examples
///
/// ```
/// use spring_batch_core::core::exit_status::ExitStatus;
///
/// assert_eq!(ExitStatus::FINISHED.and(&ExitStatus::CONTINUABLE), ExitStatus::FINISHED);
/// assert_eq!(ExitStatus::CONTINUABLE.and(&ExitStatus::CONTINUABLE), ExitStatus::CONTINUABLE);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    continuable: bool,
    exit_code: Cow<'static, str>,
    exit_description: Cow<'static, str>,
}

impl ExitStatus {
    /// Processing state is not known, more work may follow.
    pub const UNKNOWN: ExitStatus = ExitStatus::constant(true, "UNKNOWN");
    /// There is more work to do.
    pub const CONTINUABLE: ExitStatus = ExitStatus::constant(true, "CONTINUABLE");
    /// Processing is finished.
    pub const FINISHED: ExitStatus = ExitStatus::constant(false, "COMPLETED");
    /// Processing finished without doing anything.
    pub const NOOP: ExitStatus = ExitStatus::constant(false, "NOOP");
    /// Processing stopped on request.
    pub const STOPPED: ExitStatus = ExitStatus::constant(false, "STOPPED");
    /// Processing failed.
    pub const FAILED: ExitStatus = ExitStatus::constant(false, "FAILED");

    const fn constant(continuable: bool, exit_code: &'static str) -> Self {
        Self {
            continuable,
            exit_code: Cow::Borrowed(exit_code),
            exit_description: Cow::Borrowed(""),
        }
    }

    pub fn new(continuable: bool, exit_code: impl Into<String>) -> Self {
        Self {
            continuable,
            exit_code: Cow::Owned(exit_code.into()),
            exit_description: Cow::Borrowed(""),
        }
    }

    pub fn is_continuable(&self) -> bool {
        self.continuable
    }

    pub fn exit_code(&self) -> &str {
        &self.exit_code
    }

    pub fn exit_description(&self) -> &str {
        &self.exit_description
    }

    /// Same status with the continuable flag combined with `continuable`.
    pub fn and_continuable(&self, continuable: bool) -> ExitStatus {
        ExitStatus {
            continuable: self.continuable && continuable,
            ..self.clone()
        }
    }

    /// Combines two statuses.
    ///
    /// The result is continuable only if both are. Code and description are
    /// taken from the more terminal side: non-continuable wins over
    /// continuable, then the code with the higher severity, then the greater
    /// code and description so that the combination does not depend on the
    /// order of the operands.
    pub fn and(&self, other: &ExitStatus) -> ExitStatus {
        let winner = if self.terminal_rank() >= other.terminal_rank() {
            self
        } else {
            other
        };
        winner.and_continuable(self.continuable && other.continuable)
    }

    fn terminal_rank(&self) -> (bool, u8, &str, &str) {
        (
            !self.continuable,
            severity(&self.exit_code),
            &self.exit_code,
            &self.exit_description,
        )
    }

    pub fn with_description(&self, description: impl Into<String>) -> ExitStatus {
        ExitStatus {
            exit_description: Cow::Owned(description.into()),
            ..self.clone()
        }
    }

    /// Appends a description to the existing one, separated by `"; "`.
    pub fn add_description(&self, description: &str) -> ExitStatus {
        if description.is_empty() || self.exit_description == description {
            return self.clone();
        }
        if self.exit_description.is_empty() {
            return self.with_description(description);
        }
        self.with_description(format!("{}; {}", self.exit_description, description))
    }

    pub fn replace_exit_code(&self, exit_code: impl Into<String>) -> ExitStatus {
        ExitStatus {
            exit_code: Cow::Owned(exit_code.into()),
            ..self.clone()
        }
    }

    /// A continuable status whose code is not `UNKNOWN` means work is in progress.
    pub fn is_running(&self) -> bool {
        self.continuable && self.exit_code != "UNKNOWN"
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        ExitStatus::UNKNOWN
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "continuable={};exitCode={};exitDescription={}",
            self.continuable, self.exit_code, self.exit_description
        )
    }
}

fn severity(exit_code: &str) -> u8 {
    match exit_code {
        "CONTINUABLE" | "EXECUTING" => 1,
        "COMPLETED" => 2,
        "NOOP" => 3,
        "STOPPED" => 4,
        "FAILED" => 5,
        "UNKNOWN" => 6,
        _ => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_wins_over_continuable() {
        assert_eq!(
            ExitStatus::FINISHED.and(&ExitStatus::CONTINUABLE),
            ExitStatus::FINISHED
        );
        assert_eq!(
            ExitStatus::CONTINUABLE.and(&ExitStatus::FINISHED),
            ExitStatus::FINISHED
        );
    }

    #[test]
    fn continuable_and_continuable() {
        assert_eq!(
            ExitStatus::CONTINUABLE.and(&ExitStatus::CONTINUABLE),
            ExitStatus::CONTINUABLE
        );
    }

    #[test]
    fn and_is_commutative_between_terminal_codes() {
        let custom = ExitStatus::new(false, "CUSTOM").with_description("custom end");
        for (left, right) in [
            (ExitStatus::FAILED, ExitStatus::FINISHED),
            (ExitStatus::NOOP, custom.clone()),
            (ExitStatus::UNKNOWN, ExitStatus::CONTINUABLE),
            (ExitStatus::STOPPED, ExitStatus::FAILED),
        ] {
            assert_eq!(left.and(&right), right.and(&left));
        }
        assert_eq!(ExitStatus::FAILED.and(&ExitStatus::FINISHED), ExitStatus::FAILED);
        assert_eq!(ExitStatus::NOOP.and(&custom), custom);
    }

    #[test]
    fn and_continuable_keeps_code() {
        let status = ExitStatus::CONTINUABLE.and_continuable(false);
        assert!(!status.is_continuable());
        assert_eq!(status.exit_code(), "CONTINUABLE");
    }

    #[test]
    fn descriptions() {
        let status = ExitStatus::FAILED
            .add_description("first")
            .add_description("second")
            .add_description("second");
        assert_eq!(status.exit_description(), "first; second");
        assert_eq!(status.replace_exit_code("BROKEN").exit_code(), "BROKEN");
    }

    #[test]
    fn equality_covers_description() {
        assert_ne!(
            ExitStatus::FAILED,
            ExitStatus::FAILED.with_description("disk full")
        );
        assert_eq!(ExitStatus::new(false, "COMPLETED"), ExitStatus::FINISHED);
    }

    #[test]
    fn serialization_preserves_value() {
        let status = ExitStatus::FAILED.with_description("disk full");
        let json = serde_json::to_string(&status).unwrap();
        let restored: ExitStatus = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, status);
        assert!(!restored.is_continuable());
        assert_eq!(restored.exit_code(), "FAILED");

        let json = serde_json::to_string(&ExitStatus::CONTINUABLE).unwrap();
        let restored: ExitStatus = serde_json::from_str(&json).unwrap();
        assert!(restored.is_continuable());
        assert_eq!(restored.exit_code(), "CONTINUABLE");
    }

    #[test]
    fn running() {
        assert!(ExitStatus::CONTINUABLE.is_running());
        assert!(!ExitStatus::UNKNOWN.is_running());
        assert!(!ExitStatus::FINISHED.is_running());
    }
}
