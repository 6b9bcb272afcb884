use std::fmt;
use std::path::{Component, Path, PathBuf};

use super::stager::{PayloadKind, STDERR_FILE, STDOUT_FILE};
use crate::error::StageError;

/// Entry script looked up in an archive when no command is given.
pub const DEFAULT_ENTRY: &str = "run.sh";

/// Shell used for inline commands and scripts.
pub const SHELL: &str = "/bin/sh";

/// A synthesized job invocation. Nothing is executed until the executor
/// turns it into a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    /// Literal command line from the message body, run with `sh -c`.
    Inline(String),
    /// `sh <entry>` inside the sandbox, output captured to files.
    Script { sandbox: PathBuf, entry: String },
    /// `./<entry>` inside the sandbox after restoring its executable bit,
    /// output captured to files.
    Executable { sandbox: PathBuf, entry: String },
}

impl JobCommand {
    /// Program and arguments, without any shell interpolation.
    pub fn argv(&self) -> (PathBuf, Vec<String>) {
        match self {
            JobCommand::Inline(body) => (PathBuf::from(SHELL), vec!["-c".to_string(), body.clone()]),
            JobCommand::Script { entry, .. } => (PathBuf::from(SHELL), vec![entry.clone()]),
            // Resolved against the working directory, which is the sandbox.
            JobCommand::Executable { entry, .. } => (Path::new(".").join(entry), Vec::new()),
        }
    }

    pub fn sandbox(&self) -> Option<&Path> {
        match self {
            JobCommand::Inline(_) => None,
            JobCommand::Script { sandbox, .. } | JobCommand::Executable { sandbox, .. } => {
                Some(sandbox)
            }
        }
    }

    /// File that must be made executable before running.
    pub fn executable(&self) -> Option<PathBuf> {
        match self {
            JobCommand::Executable { sandbox, entry } => Some(sandbox.join(entry)),
            _ => None,
        }
    }
}

/// Shell rendering of the command, for logs.
impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobCommand::Inline(body) => write!(f, "{}", body),
            JobCommand::Script { sandbox, entry } => write!(
                f,
                "cd {} && {} {} > {} 2> {}",
                sandbox.display(),
                SHELL,
                entry,
                STDOUT_FILE,
                STDERR_FILE
            ),
            JobCommand::Executable { sandbox, entry } => write!(
                f,
                "cd {} && chmod +x {} && ./{} > {} 2> {}",
                sandbox.display(),
                entry,
                entry,
                STDOUT_FILE,
                STDERR_FILE
            ),
        }
    }
}

/// Entry names must stay inside the sandbox.
fn check_entry(entry: &str) -> Result<(), StageError> {
    let path = Path::new(entry);
    let inside = !entry.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if inside {
        Ok(())
    } else {
        Err(StageError::BadEntry(entry.to_string()))
    }
}

/// Decide how to run a job.
///
/// `staged` is `None` for inline commands; otherwise the sandbox path, the
/// staged file name and its kind.
pub fn synthesize(
    inline: Option<&str>,
    staged: Option<(&Path, &str, PayloadKind)>,
    command: Option<&str>,
) -> Result<JobCommand, StageError> {
    let (sandbox, filename, kind) = match staged {
        None => return Ok(JobCommand::Inline(inline.unwrap_or_default().to_string())),
        Some(staged) => staged,
    };

    match kind {
        PayloadKind::ShellScript => Ok(JobCommand::Script {
            sandbox: sandbox.to_path_buf(),
            entry: filename.to_string(),
        }),
        PayloadKind::ZipArchive => match command {
            Some(entry) => {
                check_entry(entry)?;
                if !sandbox.join(entry).is_file() {
                    return Err(StageError::MissingEntry(entry.to_string()));
                }
                Ok(JobCommand::Executable {
                    sandbox: sandbox.to_path_buf(),
                    entry: entry.to_string(),
                })
            }
            None => {
                if !sandbox.join(DEFAULT_ENTRY).is_file() {
                    return Err(StageError::MissingEntry(DEFAULT_ENTRY.to_string()));
                }
                Ok(JobCommand::Script {
                    sandbox: sandbox.to_path_buf(),
                    entry: DEFAULT_ENTRY.to_string(),
                })
            }
        },
        PayloadKind::Unsupported => Err(StageError::Unsupported(filename.to_string())),
    }
}
