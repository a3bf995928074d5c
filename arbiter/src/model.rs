//! Row types hydrated from the attempt queue.

/// The contestant who submitted an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub login: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub id: i32,
    pub name: String,
    /// Location of the test files, relative to the problems root.
    pub path: String,
    /// Milliseconds.
    pub time_limit: i32,
    /// Megabytes.
    pub memory_limit: i32,
    /// Checker command line; the first word is a codename, an absolute
    /// path, or a path relative to the problem directory.
    pub checker: String,
    /// printf-style mask of input file names, e.g. `%02d.in`.
    pub mask_in: String,
    /// printf-style mask of answer file names; empty when the checker
    /// needs no reference answer.
    pub mask_out: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contest {
    pub id: i32,
    /// School contests run every test and score proportionally;
    /// competitive ones stop at the first failure.
    pub is_school: bool,
}

/// A problem as it appears in a particular contest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemInContest {
    pub problem: Problem,
    pub contest: Contest,
    /// Display number within the contest.
    pub number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiler {
    pub name: String,
    pub codename: String,
    pub runner_codename: String,
}

/// A claimed submission, with everything needed to judge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub id: i32,
    pub pic: ProblemInContest,
    pub user: User,
    pub source: String,
    pub compiler: Compiler,
}
