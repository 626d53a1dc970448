// Copyright 2023 Oxide Computer Company
//! Process exit codes shared by the test binary and the controller.
use strum::Display;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
/// Some, but not all, of the selected tests passed.
pub const PARTIALLY_PASSED: i32 = 2;
/// Recording or injecting the shutdown counters failed.
pub const DIMM_OPERATION_FAILED: i32 = 3;
/// What ssh returns when the connection could not be made or was lost.
pub const CONNECTION_ERROR: i32 = 255;

/// The test binary ends its output with this, followed by its exit code,
/// so the code survives a connection that dropped on the way out.
pub const RETURN_CODE_LINE: &str = "Return code of tests execution:";

/// Find the exit code a phase reported in its captured output.
pub fn parse_return_code(output: &str) -> Option<i32> {
    output
        .lines()
        .rev()
        .find_map(|l| {
            l.trim().strip_prefix(RETURN_CODE_LINE)?.trim().parse().ok()
        })
}

/// Outcome of one phase as reported by its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Passed,
    PartiallyPassed,
    Failed,
    DimmOperationFailed,
}

impl RunStatus {
    /// Fold a batch of test results into a status. An empty batch passes.
    pub fn from_counts(passed: usize, failed: usize) -> Self {
        match (passed, failed) {
            (_, 0) => RunStatus::Passed,
            (0, _) => RunStatus::Failed,
            _ => RunStatus::PartiallyPassed,
        }
    }

    pub fn from_exit_code(code: i32) -> Self {
        match code {
            SUCCESS => RunStatus::Passed,
            PARTIALLY_PASSED => RunStatus::PartiallyPassed,
            DIMM_OPERATION_FAILED => RunStatus::DimmOperationFailed,
            _ => RunStatus::Failed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Passed => SUCCESS,
            RunStatus::PartiallyPassed => PARTIALLY_PASSED,
            RunStatus::Failed => FAILURE,
            RunStatus::DimmOperationFailed => DIMM_OPERATION_FAILED,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn return_code_from_output() {
        let out = "[  PASSED  ] 3 tests.\nReturn code of tests execution: 2\n";
        assert_eq!(parse_return_code(out), Some(2));
        assert_eq!(parse_return_code("ssh: connection closed\n"), None);
        let twice = format!("{} 1\n{} 0", RETURN_CODE_LINE, RETURN_CODE_LINE);
        assert_eq!(parse_return_code(&twice), Some(0));
        let garbage = format!("{} x", RETURN_CODE_LINE);
        assert_eq!(parse_return_code(&garbage), None);
    }

    #[test]
    fn counts() {
        assert_eq!(RunStatus::from_counts(0, 0), RunStatus::Passed);
        assert_eq!(RunStatus::from_counts(4, 0), RunStatus::Passed);
        assert_eq!(RunStatus::from_counts(0, 2), RunStatus::Failed);
        assert_eq!(RunStatus::from_counts(3, 1), RunStatus::PartiallyPassed);
    }

    #[test]
    fn exit_codes() {
        for s in [
            RunStatus::Passed,
            RunStatus::PartiallyPassed,
            RunStatus::Failed,
            RunStatus::DimmOperationFailed,
        ] {
            assert_eq!(RunStatus::from_exit_code(s.exit_code()), s);
        }
        assert_eq!(RunStatus::from_exit_code(42), RunStatus::Failed);
        assert_eq!(
            RunStatus::from_exit_code(CONNECTION_ERROR),
            RunStatus::Failed
        );
    }
}
