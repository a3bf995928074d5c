//! The per-attempt judging pipeline.
//!
//! One attempt at a time: compile the submission, walk the problem's test
//! files, run each under the sandbox, refine the sandbox's verdict with
//! the checker, and persist state transitions as they happen. The final
//! database write is always the terminal result.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Instant;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info};

use crate::config::{Behaviour, StagingFiles};
use crate::model::Attempt;
use crate::protocol;
use crate::store::{AttemptStore, ResultUpdate, StoreError};
use crate::toolchain::Toolchains;
use crate::verdict::Verdict;

/// Why an attempt could not be judged to completion.
#[derive(Debug, Error)]
pub enum JudgeError {
    /// Aborts the current attempt; the worker carries on. The attempt's
    /// last persisted state is left as it was.
    #[error("{0}")]
    Recoverable(String),
    /// Takes the worker down.
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Errors that cannot be pinned on the attempt being judged.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for JudgeError {
    fn from(e: StoreError) -> JudgeError {
        JudgeError::Fatal(e.into())
    }
}

impl From<std::io::Error> for JudgeError {
    fn from(e: std::io::Error) -> JudgeError {
        JudgeError::Fatal(e.into())
    }
}

/// Everything the pipeline needs besides the store and the attempt.
pub struct JudgeEnv<'a> {
    pub toolchains: &'a Toolchains,
    pub behaviour: &'a Behaviour,
    pub problems_dir: &'a Path,
    pub files: &'a StagingFiles,
    pub cwd: &'a Path,
}

/// Judges one claimed attempt end to end.
///
/// Returns `Ok` both for verdicts and for compilation errors; `Err` means
/// the attempt (recoverable) or the worker (fatal) is in trouble.
pub async fn process_attempt<S: AttemptStore>(
    store: &mut S,
    env: &JudgeEnv<'_>,
    attempt: &Attempt,
) -> Result<(), JudgeError> {
    let started = Instant::now();
    let problem = &attempt.pic.problem;
    info!(
        "{} [{:05}/{:03}] {:03}#{}: \"{}\" by {} ({})",
        chrono::Local::now().format("%d.%m.%y %H:%M:%S"),
        attempt.id,
        problem.id,
        attempt.pic.contest.id,
        attempt.pic.number,
        problem.name,
        attempt.user.username,
        attempt.user.login,
    );
    info!(
        "{} / {} sec / {} MB / {}",
        attempt.compiler.name,
        format_time_limit(problem.time_limit),
        problem.memory_limit,
        problem.checker,
    );

    clean_dir(env.cwd)?;

    info!("compiling");
    store
        .update_result(attempt.id, ResultUpdate::state("Compiling..."))
        .await?;
    let compiled = compile(env, &attempt.compiler.codename, &attempt.source).await?;
    if !compiled.stderr.is_empty() {
        fs_err::write(&env.files.compiler_log, &compiled.stderr)?;
    }
    match compiled.artifact {
        None => {
            info!("compilation error");
            let diagnostic = String::from_utf8_lossy(&compiled.stderr).into_owned();
            store
                .update_result(
                    attempt.id,
                    ResultUpdate::state("Compilation error").with_error(diagnostic),
                )
                .await?;
        }
        Some(artifact) => {
            run_tests(store, env, attempt, &artifact).await?;
            info!("completed in {:.1} seconds", started.elapsed().as_secs_f64());
        }
    }
    Ok(())
}

async fn run_tests<S: AttemptStore>(
    store: &mut S,
    env: &JudgeEnv<'_>,
    attempt: &Attempt,
    artifact: &[u8],
) -> Result<(), JudgeError> {
    let problem = &attempt.pic.problem;
    let is_school = attempt.pic.contest.is_school;
    let multiplier = env.behaviour.time_multiplier;
    let Some(runner) = env.toolchains.runners.get(&attempt.compiler.runner_codename) else {
        return Err(JudgeError::Recoverable(format!(
            "Runner '{}' is not registered",
            attempt.compiler.runner_codename
        )));
    };
    // The limit handed to the sandbox is shrunk by the multiplier; the
    // measurements it reports are scaled back up below.
    let scaled_limit = (problem.time_limit as f64 / multiplier + 0.5) as i64;
    let runner_args: Vec<OsString> = vec![
        env.files.stdin.clone().into(),
        env.files.stdout.clone().into(),
        env.files.stderr.clone().into(),
        scaled_limit.to_string().into(),
        problem.memory_limit.to_string().into(),
    ];
    let problem_root = env.problems_dir.join(&problem.path);

    let mut checker: Option<CheckerCommand> = None;
    let mut max_time_ms: i64 = 1;
    let mut max_memory_kb: i64 = 125;
    let mut passed_tests: i32 = 0;
    let mut tests_run: i32 = 0;
    let mut failure: Option<String> = None;

    for test_number in 1.. {
        let input = problem_root.join(format_mask(&problem.mask_in, test_number));
        if !input.is_file() {
            break;
        }
        tests_run = test_number;
        info!("test {test_number}");

        store
            .update_result(
                attempt.id,
                ResultUpdate::state(format!("Testing... {test_number}"))
                    .with_stats(seconds(max_time_ms), megabytes(max_memory_kb)),
            )
            .await?;

        fs_err::copy(&input, &env.files.stdin)?;
        let mut record = run_sandboxed(env, runner, &runner_args, artifact).await?;
        record.cpu_time_ms = rescale(record.cpu_time_ms, multiplier);
        record.real_time_ms = rescale(record.real_time_ms, multiplier);
        let vm_size_kb = record.vm_size_bytes >> 10;
        max_time_ms = max_time_ms.max(record.cpu_time_ms);
        max_memory_kb = max_memory_kb.max(vm_size_kb);

        let mut checker_comment = String::new();
        if record.verdict == Verdict::TimeLimit {
            record.verdict = reclassify_idleness(
                record.cpu_time_ms,
                record.real_time_ms,
                problem.time_limit,
            );
        } else if record.verdict == Verdict::Ok {
            if checker.is_none() {
                checker = Some(locate_checker(
                    env.toolchains,
                    &problem.checker,
                    &problem_root,
                )?);
            }
            let command = checker.as_ref().expect("resolved above");
            let answer = if problem.mask_out.is_empty() {
                PathBuf::from("/dev/null")
            } else {
                problem_root.join(format_mask(&problem.mask_out, test_number))
            };
            let (verdict, raw_comment) =
                check_output(command, &input, &env.files.stdout, &answer, &problem_root).await?;
            record.verdict = verdict;
            checker_comment = truncate_comment(
                String::from_utf8_lossy(&raw_comment).into_owned(),
                env.behaviour.checker_comment_max_len,
            );
        }

        if is_school {
            store
                .record_test_info(
                    attempt.id,
                    test_number,
                    record.verdict.label(),
                    seconds(record.cpu_time_ms.max(1)),
                    vm_size_kb.max(125) as f64,
                    &checker_comment,
                )
                .await?;
            if record.verdict == Verdict::Ok {
                passed_tests += 1;
            }
        }

        if record.verdict == Verdict::SystemError {
            error!("checker failed on test {test_number}");
            store
                .update_result(
                    attempt.id,
                    ResultUpdate::state(format!("System error on test {test_number}"))
                        .with_stats(seconds(max_time_ms), megabytes(max_memory_kb))
                        .with_comment(checker_comment),
                )
                .await?;
            return Ok(());
        }
        if !is_school && record.verdict != Verdict::Ok {
            let result = format!("{} on test {test_number}", record.verdict.label());
            store
                .update_result(
                    attempt.id,
                    ResultUpdate::state(result.clone())
                        .with_stats(seconds(max_time_ms), megabytes(max_memory_kb))
                        .with_comment(checker_comment),
                )
                .await?;
            failure = Some(result);
            break;
        }
    }

    if tests_run == 0 {
        return Err(JudgeError::Recoverable("No tests found".to_owned()));
    }

    let used_time = seconds(max_time_ms);
    let used_memory = megabytes(max_memory_kb);
    let result = match failure {
        Some(result) => result,
        None if is_school => {
            let score = f64::from(passed_tests) / f64::from(tests_run);
            store
                .update_result(
                    attempt.id,
                    ResultUpdate::state("Tested")
                        .with_stats(used_time, used_memory)
                        .with_score(score * 100.0),
                )
                .await?;
            format!("{:.1}%", score * 100.0)
        }
        None => {
            store
                .update_result(
                    attempt.id,
                    ResultUpdate::state("Accepted").with_stats(used_time, used_memory),
                )
                .await?;
            "Accepted".to_owned()
        }
    };
    info!("{result} ({used_time:.3} sec / {used_memory:.1} MB)");
    Ok(())
}

struct Compiled {
    /// The artifact bytes, present only when the compiler succeeded.
    artifact: Option<Vec<u8>>,
    stderr: Vec<u8>,
}

async fn compile(
    env: &JudgeEnv<'_>,
    codename: &str,
    source: &str,
) -> Result<Compiled, JudgeError> {
    let Some(compiler) = env.toolchains.compilers.get(codename) else {
        return Err(JudgeError::Recoverable(format!(
            "Compiler '{codename}' is not registered"
        )));
    };
    let output = run_with_input(
        Command::new(compiler)
            .current_dir(env.cwd)
            .stderr(Stdio::piped()),
        source.as_bytes(),
    )
    .await?;
    Ok(Compiled {
        artifact: output.status.success().then_some(output.stdout),
        stderr: output.stderr,
    })
}

async fn run_sandboxed(
    env: &JudgeEnv<'_>,
    runner: &Path,
    runner_args: &[OsString],
    artifact: &[u8],
) -> Result<protocol::RunRecord, JudgeError> {
    let output = run_with_input(
        Command::new(runner).args(runner_args).current_dir(env.cwd),
        artifact,
    )
    .await?;
    fs_err::write(&env.files.ejudge_log, &output.stdout)?;
    protocol::parse(&output.stdout).map_err(|e| JudgeError::Recoverable(e.to_string()))
}

/// Spawns the command with `data` fed on stdin and stdout captured.
/// Stderr is captured only if the caller piped it.
async fn run_with_input(command: &mut Command, data: &[u8]) -> std::io::Result<Output> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let mut stdin = child.stdin.take().expect("stdin is piped");
    let data = data.to_vec();
    let feed = async move {
        // The child may exit without draining its stdin; that is its
        // business, not an error here.
        let _ = stdin.write_all(&data).await;
        drop(stdin);
    };
    let (output, ()) = tokio::join!(child.wait_with_output(), feed);
    output
}

/// A resolved checker invocation: the program and its fixed leading
/// arguments, before the per-test file paths.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CheckerCommand {
    program: PathBuf,
    args: Vec<String>,
}

fn locate_checker(
    toolchains: &Toolchains,
    command_line: &str,
    problem_root: &Path,
) -> Result<CheckerCommand, JudgeError> {
    let mut words = shell_words::split(command_line)
        .map_err(|e| JudgeError::Recoverable(format!("Malformed checker command: {e}")))?;
    if words.is_empty() {
        return Err(JudgeError::Recoverable("Checker is empty".to_owned()));
    }
    let head = words.remove(0);
    let program = if Path::new(&head).is_absolute() {
        PathBuf::from(head)
    } else {
        match toolchains.checkers.get(&head) {
            Some(path) => path.clone(),
            None => problem_root.join(&head),
        }
    };
    if !program.is_file() {
        return Err(JudgeError::Recoverable("Checker is not found".to_owned()));
    }
    Ok(CheckerCommand {
        program,
        args: words,
    })
}

/// Runs the checker on one test. The working directory is the problem
/// root, so commands like `java Check` resolve their class files there.
async fn check_output(
    checker: &CheckerCommand,
    input: &Path,
    output: &Path,
    answer: &Path,
    problem_root: &Path,
) -> std::io::Result<(Verdict, Vec<u8>)> {
    let result = Command::new(&checker.program)
        .args(&checker.args)
        .arg(input)
        .arg(output)
        .arg(answer)
        .current_dir(problem_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;
    // A checker killed by a signal has no exit code; that is a system
    // error like any other out-of-convention termination.
    let verdict = match result.status.code() {
        Some(code) => Verdict::from_checker_code(code),
        None => Verdict::SystemError,
    };
    Ok((verdict, result.stderr))
}

/// Removes every file and directory inside `path`.
fn clean_dir(path: &Path) -> std::io::Result<()> {
    for entry in fs_err::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs_err::remove_dir_all(entry.path())?;
        } else {
            fs_err::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// The sandbox cannot tell a stalled process from a busy one: a TL report
/// whose CPU time is under the limit while the wall clock is at or over
/// it is an idleness limit.
fn reclassify_idleness(cpu_time_ms: i64, real_time_ms: i64, time_limit_ms: i32) -> Verdict {
    let limit = i64::from(time_limit_ms);
    if cpu_time_ms < limit && real_time_ms >= limit {
        Verdict::IdlenessLimit
    } else {
        Verdict::TimeLimit
    }
}

/// printf-style formatting of a test-file mask: `%d` with an optional
/// width and zero-padding (`%3d`, `%02d`), and `%%` for a literal percent
/// sign. Anything else after `%` is left verbatim.
pub fn format_mask(mask: &str, n: i32) -> String {
    let mut out = String::with_capacity(mask.len() + 4);
    let mut chars = mask.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let zero = chars.peek() == Some(&'0');
        if zero {
            chars.next();
        }
        let mut width = 0usize;
        while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
            width = width * 10 + digit as usize;
            chars.next();
        }
        match chars.next() {
            Some('d') => {
                let digits = n.to_string();
                for _ in digits.len()..width {
                    out.push(if zero { '0' } else { ' ' });
                }
                out.push_str(&digits);
            }
            other => {
                out.push('%');
                if zero {
                    out.push('0');
                }
                if width > 0 {
                    out.push_str(&width.to_string());
                }
                if let Some(other) = other {
                    out.push(other);
                }
            }
        }
    }
    out
}

/// Truncates to at most `max_len` characters; a truncated comment ends
/// with a three-character ellipsis marker.
fn truncate_comment(comment: String, max_len: usize) -> String {
    if comment.chars().count() <= max_len {
        return comment;
    }
    let mut truncated: String = comment.chars().take(max_len - 3).collect();
    truncated.push_str("...");
    truncated
}

fn rescale(value_ms: i64, multiplier: f64) -> i64 {
    (value_ms as f64 * multiplier + 0.5) as i64
}

fn seconds(ms: i64) -> f64 {
    ms as f64 / 1000.0
}

fn megabytes(kb: i64) -> f64 {
    kb as f64 / 1024.0
}

fn format_time_limit(ms: i32) -> String {
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        (f64::from(ms) / 1000.0).to_string()
    }
}
