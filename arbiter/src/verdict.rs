//! The closed set of judging outcomes.

use std::fmt;

/// Outcome of a single test run, or of an attempt as a whole.
///
/// The sandbox reports the first five directly; `WrongAnswer`,
/// `PresentationError` and `SystemError` come from the checker, and
/// `IdlenessLimit` is derived from a `TimeLimit` report whose CPU time is
/// under the limit while the wall clock is over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Ok,
    TimeLimit,
    IdlenessLimit,
    MemoryLimit,
    RuntimeError,
    SecurityViolation,
    WrongAnswer,
    PresentationError,
    SystemError,
}

impl Verdict {
    /// Human label used in database result strings and logs.
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Ok => "OK",
            Verdict::TimeLimit => "Time limit exceeded",
            Verdict::IdlenessLimit => "Idleness limit exceeded",
            Verdict::MemoryLimit => "Memory limit exceeded",
            Verdict::RuntimeError => "Run-time error",
            Verdict::SecurityViolation => "Security violation",
            Verdict::WrongAnswer => "Wrong answer",
            Verdict::PresentationError => "Presentation error",
            Verdict::SystemError => "System error",
        }
    }

    /// Maps a sandbox `Status` value. Only the five statuses the sandbox
    /// can report are recognised.
    pub fn from_status(status: &str) -> Option<Verdict> {
        match status {
            "OK" => Some(Verdict::Ok),
            "TL" => Some(Verdict::TimeLimit),
            "ML" => Some(Verdict::MemoryLimit),
            "RT" => Some(Verdict::RuntimeError),
            "SV" => Some(Verdict::SecurityViolation),
            _ => None,
        }
    }

    /// Maps a testlib-compatible checker exit code. Total over all
    /// integers: anything outside the convention is a system error.
    pub fn from_checker_code(code: i32) -> Verdict {
        match code {
            0 => Verdict::Ok,
            1 => Verdict::WrongAnswer,
            2 => Verdict::PresentationError,
            _ => Verdict::SystemError,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checker_code_mapping_is_total() {
        assert_eq!(Verdict::from_checker_code(0), Verdict::Ok);
        assert_eq!(Verdict::from_checker_code(1), Verdict::WrongAnswer);
        assert_eq!(Verdict::from_checker_code(2), Verdict::PresentationError);
        for code in [-128, -1, 3, 4, 42, 255, i32::MIN, i32::MAX] {
            assert_eq!(Verdict::from_checker_code(code), Verdict::SystemError);
        }
    }

    #[test]
    fn status_mapping() {
        assert_eq!(Verdict::from_status("OK"), Some(Verdict::Ok));
        assert_eq!(Verdict::from_status("TL"), Some(Verdict::TimeLimit));
        assert_eq!(Verdict::from_status("ML"), Some(Verdict::MemoryLimit));
        assert_eq!(Verdict::from_status("RT"), Some(Verdict::RuntimeError));
        assert_eq!(Verdict::from_status("SV"), Some(Verdict::SecurityViolation));
        // IL/WA/PE/SE never come from the sandbox.
        assert_eq!(Verdict::from_status("IL"), None);
        assert_eq!(Verdict::from_status("WA"), None);
        assert_eq!(Verdict::from_status("ok"), None);
        assert_eq!(Verdict::from_status(""), None);
    }

    #[test]
    fn labels() {
        assert_eq!(Verdict::Ok.to_string(), "OK");
        assert_eq!(Verdict::TimeLimit.to_string(), "Time limit exceeded");
        assert_eq!(Verdict::IdlenessLimit.to_string(), "Idleness limit exceeded");
        assert_eq!(Verdict::WrongAnswer.to_string(), "Wrong answer");
        assert_eq!(Verdict::SystemError.to_string(), "System error");
    }
}
