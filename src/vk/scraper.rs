//! Player-page downloads through an external `yt-dlp` binary.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::attachments::download::PageDownloader;
use crate::error::{truncate_error, ScrapeError};

const ACCESS_MARKERS: [&str; 12] = [
    "private",
    "sign in",
    "log in",
    "login",
    "authoriz",
    "access denied",
    "access restricted",
    "http error 401",
    "http error 403",
    "registered users",
    "age-restrict",
    "cookies",
];

pub struct YtDlp {
    binary: String,
}

impl YtDlp {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl PageDownloader for YtDlp {
    fn download(&self, page_url: &str, target_dir: &Path, stem: &str) -> Result<PathBuf, ScrapeError> {
        let page_url = page_url.trim();
        if page_url.is_empty() || page_url.starts_with('-') || page_url.contains('\0') {
            return Err(ScrapeError::Failed(format!("unsupported player url `{page_url}`")));
        }

        let template = target_dir.join(format!("{stem}.%(ext)s"));
        debug!("{} fetching {page_url}", self.binary);
        let output = Command::new(&self.binary)
            .arg("--no-playlist")
            .arg("--no-progress")
            .arg("-o")
            .arg(&template)
            .arg("--")
            .arg(page_url)
            .output()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => ScrapeError::Unavailable(self.binary.clone()),
                _ => ScrapeError::Failed(format!("could not start {}: {err}", self.binary)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, &output.status.to_string()));
        }

        find_output(target_dir, stem).ok_or_else(|| {
            ScrapeError::Failed(format!("{} exited cleanly but wrote no file", self.binary))
        })
    }
}

/// Map downloader stderr to a failure kind. Authorization and privacy
/// problems are reported separately from generic errors.
pub fn classify_failure(stderr: &str, status: &str) -> ScrapeError {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|line| !line.is_empty()).collect();
    let Some(line) = lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| lines.last())
    else {
        return ScrapeError::Failed(format!("exit {status}"));
    };
    let message = truncate_error(line);

    // Warnings and echoed URLs mention cookies and logins routinely.
    let lowered = line.to_lowercase();
    if ACCESS_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        ScrapeError::AccessRestricted(message)
    } else {
        ScrapeError::Failed(message)
    }
}

fn find_output(dir: &Path, stem: &str) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                return false;
            };
            path.is_file()
                && path.file_stem().and_then(|s| s.to_str()) == Some(stem)
                && !name.ends_with(".part")
                && !name.ends_with(".ytdl")
        })
}
