//! Worker configuration.
//!
//! The config file is a YAML document:
//!
//! ```yaml
//! db:
//!   locator: "host=db.contest.lan user=judge dbname=contest"
//! dirs:
//!   problems: /srv/judge/problems
//!   compilers: /srv/judge/compilers
//!   runners: /srv/judge/runners
//!   checkers: /srv/judge/checkers
//! files:
//!   stdin: input
//!   stdout: output
//!   stderr: errors
//!   ejudge_log: ejudge.log
//!   compiler_log: compiler.log
//! behaviour:
//!   interval: 2.5
//!   time_multiplier: 1.0
//!   checker_comment_max_len: 255
//! logging:
//!   filter: info
//!   file: worker.log
//! ```
//!
//! Directories are expanded and canonicalised at load time and must exist;
//! the `behaviour` bounds are validated here so the rest of the worker can
//! rely on them.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("dirs.{0} is not set")]
    MissingDir(&'static str),
    #[error("dirs.{key} is not a directory: '{}'", path.display())]
    NotADirectory { key: &'static str, path: PathBuf },
    #[error("behaviour.{key} {requirement}")]
    InvalidValue {
        key: &'static str,
        requirement: &'static str,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db: Db,
    pub dirs: Dirs,
    pub files: Files,
    pub behaviour: Behaviour,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Db {
    /// Connection string understood by `tokio-postgres`.
    pub locator: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dirs {
    pub problems: PathBuf,
    pub compilers: PathBuf,
    pub runners: PathBuf,
    pub checkers: PathBuf,
}

/// Names of the staging and capture files inside the working directory.
#[derive(Debug, Clone, Deserialize)]
pub struct Files {
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub ejudge_log: PathBuf,
    pub compiler_log: PathBuf,
}

/// The same five files, resolved against the working directory once so the
/// worker never has to change its current directory.
#[derive(Debug, Clone)]
pub struct StagingFiles {
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub ejudge_log: PathBuf,
    pub compiler_log: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Behaviour {
    /// Seconds to sleep between polls of an empty queue.
    pub interval: f64,
    /// The sandbox host is assumed to be this many times slower than the
    /// reference machine; limits and measurements are scaled by it.
    pub time_multiplier: f64,
    /// Longest checker comment persisted, in characters.
    pub checker_comment_max_len: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Logging {
    /// Filter directive for the log subscriber, e.g. `info` or
    /// `arbiter=debug`.
    pub filter: Option<String>,
    /// Log file; relative paths are resolved against the log directory.
    pub file: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs_err::read_to_string(path)?;
        // Tolerate a BOM, which Windows editors like to prepend.
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        let mut config: Config = serde_yaml::from_str(text)?;
        config.dirs.resolve()?;
        config.behaviour.validate()?;
        Ok(config)
    }
}

impl Dirs {
    fn resolve(&mut self) -> Result<(), ConfigError> {
        for (key, dir) in [
            ("problems", &mut self.problems),
            ("compilers", &mut self.compilers),
            ("runners", &mut self.runners),
            ("checkers", &mut self.checkers),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(ConfigError::MissingDir(key));
            }
            let expanded = fs_err::canonicalize(expand_home(dir))?;
            if !expanded.is_dir() {
                return Err(ConfigError::NotADirectory {
                    key,
                    path: expanded,
                });
            }
            *dir = expanded;
        }
        Ok(())
    }
}

impl Files {
    pub fn resolve(&self, cwd: &Path) -> StagingFiles {
        StagingFiles {
            stdin: cwd.join(&self.stdin),
            stdout: cwd.join(&self.stdout),
            stderr: cwd.join(&self.stderr),
            ejudge_log: cwd.join(&self.ejudge_log),
            compiler_log: cwd.join(&self.compiler_log),
        }
    }
}

impl Behaviour {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.interval.is_finite() && self.interval > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "interval",
                requirement: "must be a positive number of seconds",
            });
        }
        if !(self.time_multiplier.is_finite() && self.time_multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                key: "time_multiplier",
                requirement: "must be at least 1",
            });
        }
        if self.checker_comment_max_len < 3 {
            return Err(ConfigError::InvalidValue {
                key: "checker_comment_max_len",
                requirement: "must be at least 3",
            });
        }
        Ok(())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, behaviour: &str) -> PathBuf {
        for sub in ["problems", "compilers", "runners", "checkers"] {
            fs_err::create_dir_all(dir.join(sub)).unwrap();
        }
        let text = format!(
            "db:\n  locator: host=localhost user=judge\n\
             dirs:\n  problems: {0}/problems\n  compilers: {0}/compilers\n  runners: {0}/runners\n  checkers: {0}/checkers\n\
             files:\n  stdin: input\n  stdout: output\n  stderr: errors\n  ejudge_log: ejudge.log\n  compiler_log: compiler.log\n\
             behaviour:\n{behaviour}",
            dir.display(),
        );
        let path = dir.join("worker.yaml");
        fs_err::write(&path, text).unwrap();
        path
    }

    const SANE_BEHAVIOUR: &str =
        "  interval: 2\n  time_multiplier: 1.5\n  checker_comment_max_len: 255\n";

    #[test]
    fn loads_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), SANE_BEHAVIOUR);

        let config = Config::load(&path).unwrap();
        assert!(config.dirs.problems.is_absolute());
        assert!(config.dirs.problems.ends_with("problems"));
        assert_eq!(config.behaviour.checker_comment_max_len, 255);
        assert_eq!(config.behaviour.time_multiplier, 1.5);
        assert!(config.logging.filter.is_none());

        let staged = config.files.resolve(Path::new("/work"));
        assert_eq!(staged.stdin, Path::new("/work/input"));
        assert_eq!(staged.ejudge_log, Path::new("/work/ejudge.log"));
    }

    #[test]
    fn tolerates_a_byte_order_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), SANE_BEHAVIOUR);
        let original = fs_err::read_to_string(&path).unwrap();
        fs_err::write(&path, format!("\u{feff}{original}")).unwrap();

        assert!(Config::load(&path).is_ok());
    }

    #[test]
    fn missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), SANE_BEHAVIOUR);
        fs_err::remove_dir(dir.path().join("runners")).unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Io(_))));
    }

    #[test]
    fn behaviour_bounds_are_enforced() {
        let dir = tempfile::tempdir().unwrap();

        let path = write_config(
            dir.path(),
            "  interval: 2\n  time_multiplier: 0.5\n  checker_comment_max_len: 255\n",
        );
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue {
                key: "time_multiplier",
                ..
            })
        ));

        let path = write_config(
            dir.path(),
            "  interval: 2\n  time_multiplier: 1\n  checker_comment_max_len: 2\n",
        );
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue {
                key: "checker_comment_max_len",
                ..
            })
        ));

        let path = write_config(
            dir.path(),
            "  interval: 0\n  time_multiplier: 1\n  checker_comment_max_len: 255\n",
        );
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidValue { key: "interval", .. })
        ));
    }
}
