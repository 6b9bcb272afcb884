use std::str::FromStr;

use validator::Validate;

use crate::broker::Headers;
use crate::error::InvalidJob;

/// Current message schema version.
pub const MESSAGE_VERSION: u32 = 1;

/// Header names on the wire.
pub mod header {
    pub const VERSION: &str = "version";
    pub const JOBID: &str = "jobid";
    pub const NAME: &str = "name";
    pub const FILENAME: &str = "filename";
    pub const COMMAND: &str = "command";
    pub const PATH: &str = "path";
    pub const FIXED_PATH: &str = "fixed-path";
    /// Spelling used by older dispatchers.
    pub const FIXED_PATH_LEGACY: &str = "path-fixed";
    pub const UPLOAD: &str = "upload";
    pub const WEBDAV_HOSTNAME: &str = "webdav-hostname";
    pub const WEBDAV_ROOT: &str = "webdav-root";
    pub const WEBDAV_LOGIN: &str = "webdav-login";
    pub const WEBDAV_PASSWORD: &str = "webdav-password";
    pub const WEBDAV_INSECURE: &str = "webdav-insecure";
}

/// How the sandbox is shipped to the remote store after execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadMode {
    None,
    Files,
    #[default]
    Zip,
}

impl FromStr for UploadMode {
    type Err = InvalidJob;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(UploadMode::None),
            "files" => Ok(UploadMode::Files),
            "zip" => Ok(UploadMode::Zip),
            _ => Err(InvalidJob::BadUploadMode(s.to_string())),
        }
    }
}

impl std::fmt::Display for UploadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadMode::None => write!(f, "none"),
            UploadMode::Files => write!(f, "files"),
            UploadMode::Zip => write!(f, "zip"),
        }
    }
}

/// Connection settings for the WebDAV result store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStore {
    pub hostname: String,
    pub root: String,
    pub login: String,
    pub password: String,
    pub insecure: bool,
}

impl Default for RemoteStore {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            root: "remote.php/webdav".to_string(),
            login: String::new(),
            password: String::new(),
            insecure: false,
        }
    }
}

/// Values used when a header is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDefaults {
    pub name: String,
    pub path: String,
    pub upload: UploadMode,
    pub remote: RemoteStore,
}

impl Default for MessageDefaults {
    fn default() -> Self {
        Self {
            name: "qsub".to_string(),
            path: "pkbs".to_string(),
            upload: UploadMode::Zip,
            remote: RemoteStore::default(),
        }
    }
}

/// What the job carries besides its headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// A file to stage into the sandbox.
    File { filename: String, data: Vec<u8> },
    /// A literal command line.
    Inline(String),
}

/// A job as pulled from the queue, with every default already applied.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct JobMessage {
    #[validate(length(min = 1, max = 64, message = "jobid must be 1 to 64 characters"))]
    pub jobid: String,
    #[validate(length(max = 128, message = "name must be at most 128 characters"))]
    pub name: String,
    pub command: Option<String>,
    #[validate(length(min = 1, message = "path must not be empty"))]
    pub path: String,
    pub fixed_path: Option<String>,
    pub upload: UploadMode,
    pub remote: RemoteStore,
    pub body: Body,
}

fn non_empty<'a>(headers: &'a Headers, key: &str) -> Option<&'a str> {
    headers
        .get(key)
        .map(|v| v.as_str())
        .filter(|v| !v.trim().is_empty())
}

fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

impl JobMessage {
    /// Parse a delivery into a typed message.
    ///
    /// Each optional header falls back to `defaults`, which already carry the
    /// environment and hardcoded fallbacks.
    pub fn from_headers(
        headers: &Headers,
        payload: Vec<u8>,
        defaults: &MessageDefaults,
    ) -> Result<Self, InvalidJob> {
        if let Some(version) = non_empty(headers, header::VERSION) {
            if version.trim().parse::<u32>().ok() != Some(MESSAGE_VERSION) {
                return Err(InvalidJob::BadVersion(version.to_string()));
            }
        }

        let jobid = non_empty(headers, header::JOBID)
            .ok_or(InvalidJob::MissingJobId)?
            .to_string();
        if !jobid.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(InvalidJob::BadJobId(jobid));
        }

        let command = non_empty(headers, header::COMMAND).map(str::to_string);

        let body = match non_empty(headers, header::FILENAME) {
            Some(filename) => {
                if !is_plain_filename(filename) {
                    return Err(InvalidJob::BadFilename(filename.to_string()));
                }
                Body::File {
                    filename: filename.to_string(),
                    data: payload,
                }
            }
            None => {
                let text = String::from_utf8(payload).map_err(|_| InvalidJob::NotUtf8)?;
                if text.trim().is_empty() {
                    return Err(InvalidJob::Empty);
                }
                Body::Inline(text)
            }
        };

        let upload = match non_empty(headers, header::UPLOAD) {
            Some(mode) => mode.parse()?,
            None => defaults.upload,
        };

        let fallback = &defaults.remote;
        let remote = RemoteStore {
            hostname: non_empty(headers, header::WEBDAV_HOSTNAME)
                .map(str::to_string)
                .unwrap_or_else(|| fallback.hostname.clone()),
            root: non_empty(headers, header::WEBDAV_ROOT)
                .map(str::to_string)
                .unwrap_or_else(|| fallback.root.clone()),
            login: non_empty(headers, header::WEBDAV_LOGIN)
                .map(str::to_string)
                .unwrap_or_else(|| fallback.login.clone()),
            password: non_empty(headers, header::WEBDAV_PASSWORD)
                .map(str::to_string)
                .unwrap_or_else(|| fallback.password.clone()),
            insecure: non_empty(headers, header::WEBDAV_INSECURE)
                .map(|v| v.trim() == "1")
                .unwrap_or(fallback.insecure),
        };

        let message = JobMessage {
            jobid,
            name: non_empty(headers, header::NAME)
                .map(str::to_string)
                .unwrap_or_else(|| defaults.name.clone()),
            command,
            path: non_empty(headers, header::PATH)
                .map(str::to_string)
                .unwrap_or_else(|| defaults.path.clone()),
            fixed_path: non_empty(headers, header::FIXED_PATH)
                .or_else(|| non_empty(headers, header::FIXED_PATH_LEGACY))
                .map(str::to_string),
            upload,
            remote,
            body,
        };

        message
            .validate()
            .map_err(|e| InvalidJob::Validation(validation_message(&e)))?;
        Ok(message)
    }

    /// Render the message back into wire headers and payload.
    pub fn to_headers(&self) -> (Headers, Vec<u8>) {
        let mut headers = Headers::new();
        headers.insert(header::VERSION.to_string(), MESSAGE_VERSION.to_string());
        headers.insert(header::JOBID.to_string(), self.jobid.clone());
        headers.insert(header::NAME.to_string(), self.name.clone());
        headers.insert(header::PATH.to_string(), self.path.clone());
        headers.insert(header::UPLOAD.to_string(), self.upload.to_string());
        if let Some(command) = &self.command {
            headers.insert(header::COMMAND.to_string(), command.clone());
        }
        if let Some(fixed) = &self.fixed_path {
            headers.insert(header::FIXED_PATH.to_string(), fixed.clone());
        }
        let payload = match &self.body {
            Body::File { filename, data } => {
                headers.insert(header::FILENAME.to_string(), filename.clone());
                data.clone()
            }
            Body::Inline(text) => text.as_bytes().to_vec(),
        };
        (headers, payload)
    }

    pub fn filename(&self) -> Option<&str> {
        match &self.body {
            Body::File { filename, .. } => Some(filename),
            Body::Inline(_) => None,
        }
    }
}

/// Flatten validator errors into one line, field by field.
fn validation_message(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("invalid field {}", field))
            })
        })
        .collect();
    messages.sort();
    messages.join("; ")
}
