//! Launchable commands and where their output goes.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// A fully resolved command, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Environment overrides, merged over the parent's environment.
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Creates a launch spec without arguments or overrides.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Renders the command line for logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Destination for a stage's stdout and stderr.
///
/// Output never flows back to the orchestrator, so a chatty stage cannot
/// block on a full pipe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogSink {
    /// Discard all output.
    #[default]
    Discard,
    /// Append to `<dir>/<stage>.log`.
    Directory(PathBuf),
}

impl LogSink {
    /// Returns the log file path for a stage, if output is kept.
    #[must_use]
    pub fn path_for(&self, stage: &str) -> Option<PathBuf> {
        match self {
            Self::Discard => None,
            Self::Directory(dir) => Some(dir.join(format!("{stage}.log"))),
        }
    }

    /// Opens stdout and stderr handles for a stage.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the log directory or file cannot be opened.
    pub fn stdio(&self, stage: &str) -> std::io::Result<(Stdio, Stdio)> {
        match self.path_for(stage) {
            None => Ok((Stdio::null(), Stdio::null())),
            Some(path) => {
                let file = open_append(&path)?;
                let stderr = file.try_clone()?;
                Ok((Stdio::from(file), Stdio::from(stderr)))
            }
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
