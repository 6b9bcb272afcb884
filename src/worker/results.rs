use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::SinkError;
use crate::job::UploadMode;
use crate::sink::{ensure_dir, join_remote, ResultSink, RetryPolicy};

/// Where a job's output goes on the remote store.
#[derive(Debug, Clone, Copy)]
pub struct Destination<'a> {
    pub jobid: &'a str,
    pub name: &'a str,
    pub path: &'a str,
    pub fixed_path: Option<&'a str>,
}

impl Destination<'_> {
    /// `{name}-{jobid}`, with path separators in the name neutralized.
    pub fn stem(&self) -> String {
        format!("{}-{}", self.name.replace(['/', '\\'], "_"), self.jobid)
    }

    /// Directory receiving the archive in zip mode.
    pub fn archive_dir(&self) -> String {
        join_remote(&[self.fixed_path.unwrap_or(self.path)])
    }

    /// Directory mirroring the sandbox in files mode.
    pub fn files_dir(&self) -> String {
        match self.fixed_path {
            Some(fixed) => join_remote(&[fixed]),
            None => join_remote(&[self.path, &self.stem()]),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub uploaded: usize,
    pub failed: usize,
}

/// Ships a finished sandbox to the remote store.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultStager {
    retry: RetryPolicy,
}

impl ResultStager {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub async fn stage(
        &self,
        sink: &dyn ResultSink,
        mode: UploadMode,
        sandbox: &Path,
        dest: Destination<'_>,
    ) -> UploadReport {
        let report = match mode {
            UploadMode::None => {
                info!(jobid = dest.jobid, "Upload disabled, nothing to stage");
                UploadReport::default()
            }
            UploadMode::Zip => self.stage_zip(sink, sandbox, dest).await,
            UploadMode::Files => self.stage_files(sink, sandbox, dest).await,
        };
        info!(
            jobid = dest.jobid,
            mode = %mode,
            uploaded = report.uploaded,
            failed = report.failed,
            "Result staging done"
        );
        report
    }

    async fn ensure_dir(&self, sink: &dyn ResultSink, remote: &str) -> Result<(), SinkError> {
        self.retry
            .run(remote, move || ensure_dir(sink, remote))
            .await
    }

    async fn upload(&self, sink: &dyn ResultSink, local: &Path, remote: &str) -> Result<(), SinkError> {
        let receipt = self
            .retry
            .run(remote, move || sink.upload(local, remote))
            .await?;
        if let Some(remote_sum) = receipt.sha256 {
            let local_sum = sha256_file(local)?;
            if local_sum != remote_sum {
                return Err(SinkError::ChecksumMismatch {
                    path: remote.to_string(),
                    local: local_sum,
                    remote: remote_sum,
                });
            }
        }
        Ok(())
    }

    async fn stage_zip(&self, sink: &dyn ResultSink, sandbox: &Path, dest: Destination<'_>) -> UploadReport {
        let failed = UploadReport {
            uploaded: 0,
            failed: 1,
        };
        let parent = sandbox.parent().unwrap_or(sandbox).to_path_buf();
        let archive = match tempfile::Builder::new()
            .prefix(&format!("{}.", dest.stem()))
            .suffix(".zip")
            .tempfile_in(&parent)
        {
            Ok(file) => file,
            Err(e) => {
                error!(jobid = dest.jobid, error = %e, "Cannot create result archive");
                return failed;
            }
        };

        let src = sandbox.to_path_buf();
        let prefix = dest.jobid.to_string();
        let target = archive.path().to_path_buf();
        let zipped = tokio::task::spawn_blocking(move || zip_dir(&src, &prefix, &target)).await;
        match zipped {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(jobid = dest.jobid, error = %e, "Cannot compress sandbox");
                return failed;
            }
            Err(e) => {
                error!(jobid = dest.jobid, error = %e, "Compression task failed");
                return failed;
            }
        }

        let dir = dest.archive_dir();
        if let Err(e) = self.ensure_dir(sink, &dir).await {
            error!(jobid = dest.jobid, remote = %dir, error = %e, "Cannot create remote directory");
            return failed;
        }

        let remote = join_remote(&[&dir, &format!("{}.zip", dest.stem())]);
        match self.upload(sink, archive.path(), &remote).await {
            Ok(()) => {
                info!(jobid = dest.jobid, remote = %remote, "Uploaded result archive");
                UploadReport {
                    uploaded: 1,
                    failed: 0,
                }
            }
            Err(e) => {
                error!(jobid = dest.jobid, remote = %remote, error = %e, "Archive upload failed");
                failed
            }
        }
    }

    async fn stage_files(&self, sink: &dyn ResultSink, sandbox: &Path, dest: Destination<'_>) -> UploadReport {
        let mut report = UploadReport::default();
        let base = dest.files_dir();
        if let Err(e) = self.ensure_dir(sink, &base).await {
            error!(jobid = dest.jobid, remote = %base, error = %e, "Cannot create remote directory");
            report.failed += 1;
            return report;
        }

        // Pre-order walk: a directory is always seen before anything inside it.
        for entry in WalkDir::new(sandbox).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(jobid = dest.jobid, error = %e, "Cannot read sandbox entry");
                    report.failed += 1;
                    continue;
                }
            };
            let relative = match relative_remote(sandbox, entry.path()) {
                Some(relative) => relative,
                None => continue,
            };
            let remote = join_remote(&[&base, &relative]);

            if entry.file_type().is_dir() {
                if let Err(e) = self.ensure_dir(sink, &remote).await {
                    error!(jobid = dest.jobid, remote = %remote, error = %e, "Cannot create remote directory");
                    report.failed += 1;
                }
            } else if entry.file_type().is_file() {
                match self.upload(sink, entry.path(), &remote).await {
                    Ok(()) => {
                        info!(jobid = dest.jobid, remote = %remote, "Uploaded file");
                        report.uploaded += 1;
                    }
                    Err(e) => {
                        error!(jobid = dest.jobid, remote = %remote, error = %e, "File upload failed");
                        report.failed += 1;
                    }
                }
            }
        }
        report
    }
}

/// `path` relative to `root`, with `/` separators.
fn relative_remote(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Compress `src` into `target`, every entry under `{prefix}/`.
pub fn zip_dir(src: &Path, prefix: &str, target: &Path) -> Result<(), SinkError> {
    let mut zip = ZipWriter::new(File::create(target)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let name = match relative_remote(src, entry.path()) {
            Some(relative) => format!("{}/{}", prefix, relative),
            None => continue,
        };
        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut zip)?;
        }
    }
    zip.finish()?;
    Ok(())
}

/// Lowercase hex SHA-256 of a local file.
pub fn sha256_file(path: &Path) -> Result<String, SinkError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
