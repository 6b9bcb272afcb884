use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::StageError;

/// Capture file for the job's standard output.
pub const STDOUT_FILE: &str = "stdout.txt";
/// Capture file for the job's standard error.
pub const STDERR_FILE: &str = "stderr.txt";

/// What a staged payload turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    ShellScript,
    ZipArchive,
    Unsupported,
}

impl PayloadKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            "text/x-sh" | "text/x-shellscript" => PayloadKind::ShellScript,
            "application/zip" => PayloadKind::ZipArchive,
            _ => PayloadKind::Unsupported,
        }
    }
}

/// Per-job working directory. Removed recursively when dropped.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
}

impl Sandbox {
    /// Create `{root}/{jobid}`. An existing directory is never reused.
    pub fn create(root: &Path, jobid: &str) -> Result<Self, StageError> {
        fs::create_dir_all(root)?;
        let path = root.join(jobid);
        match fs::create_dir(&path) {
            Ok(()) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StageError::SandboxExists(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(sandbox = %self.path.display(), "Removed sandbox"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(sandbox = %self.path.display(), error = %e, "Failed to remove sandbox"),
        }
    }
}

/// Remove the sandbox an interrupted attempt of `jobid` left behind.
/// Returns whether there was one.
pub fn discard_stale(root: &Path, jobid: &str) -> io::Result<bool> {
    let path = root.join(jobid);
    match fs::remove_dir_all(&path) {
        Ok(()) => {
            warn!(sandbox = %path.display(), "Removed stale sandbox");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// A payload written into its sandbox.
#[derive(Debug)]
pub struct StagedPayload {
    pub sandbox: Sandbox,
    pub filename: String,
    pub mime: String,
    pub kind: PayloadKind,
}

/// Interpreters whose scripts run under `/bin/sh`.
const SHELLS: &[&str] = &["sh", "bash", "dash", "ksh", "zsh"];

/// Content type of a payload, from its bytes only.
pub fn sniff(data: &[u8]) -> String {
    if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
        return "application/zip".to_string();
    }
    if data.contains(&0) {
        return "application/octet-stream".to_string();
    }
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return "application/octet-stream".to_string(),
    };
    match text.lines().next().and_then(|l| l.strip_prefix("#!")) {
        Some(shebang) => {
            let mut words = shebang.split_whitespace();
            let mut program = words.next().and_then(|p| p.rsplit('/').next()).unwrap_or("");
            if program == "env" {
                program = words.find(|w| !w.starts_with('-')).unwrap_or("");
            }
            if SHELLS.contains(&program) {
                "text/x-shellscript".to_string()
            } else {
                format!("text/x-script.{}", program)
            }
        }
        None => "text/x-sh".to_string(),
    }
}

/// Write the payload into a fresh sandbox and classify it. Zip archives are
/// extracted in place and the archive itself removed.
pub async fn stage(
    root: &Path,
    jobid: &str,
    filename: &str,
    data: Vec<u8>,
) -> Result<StagedPayload, StageError> {
    let sandbox = Sandbox::create(root, jobid)?;
    let file = sandbox.path().join(filename);
    tokio::fs::write(&file, &data).await?;

    let mime = sniff(&data);
    let kind = PayloadKind::from_mime(&mime);
    info!(jobid, mime = %mime, file = %file.display(), "Payload cached");

    match kind {
        PayloadKind::Unsupported => return Err(StageError::Unsupported(mime)),
        PayloadKind::ZipArchive => {
            let dest = sandbox.path().to_path_buf();
            tokio::task::spawn_blocking(move || extract(&file, &dest))
                .await
                .map_err(|e| StageError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        }
        PayloadKind::ShellScript => {}
    }

    Ok(StagedPayload {
        sandbox,
        filename: filename.to_string(),
        mime,
        kind,
    })
}

fn extract(archive: &Path, dest: &Path) -> Result<(), StageError> {
    let reader = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(reader)?;
    // Entries that would land outside `dest` make `extract` fail.
    zip.extract(dest)?;
    fs::remove_file(archive)?;
    debug!(archive = %archive.display(), entries = zip.len(), "Extracted archive");
    Ok(())
}
