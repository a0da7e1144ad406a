//! Byte transfer for resolved attachments.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client as BlockingHttpClient;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::files::{filename_from_url, unique_target};
use crate::error::{ScrapeError, TransferError};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Plain HTTP GET returning the response body as a stream.
pub trait HttpFetch: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, TransferError>;
}

/// External page/stream downloader used for player URLs.
pub trait PageDownloader: Send + Sync {
    /// Download the media behind `page_url` into `target_dir` as `<stem>.<ext>`
    /// and return the written file.
    fn download(&self, page_url: &str, target_dir: &Path, stem: &str) -> Result<PathBuf, ScrapeError>;
}

pub struct ReqwestFetcher {
    client: BlockingHttpClient,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = BlockingHttpClient::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpFetch for ReqwestFetcher {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, TransferError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "*/*")
            .send()
            .map_err(|err| TransferError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                code: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown status").to_string(),
            });
        }
        Ok(Box::new(response))
    }
}

/// A file written to the attachment cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Clone)]
pub struct Downloader {
    fetcher: Arc<dyn HttpFetch>,
    scraper: Arc<dyn PageDownloader>,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn HttpFetch>, scraper: Arc<dyn PageDownloader>) -> Self {
        Self { fetcher, scraper }
    }

    /// GET `url` into `dir`, naming the file after the URL path.
    pub fn download_direct(
        &self,
        url: &str,
        dir: &Path,
        type_name: &str,
    ) -> Result<Downloaded, TransferError> {
        fs::create_dir_all(dir)?;
        let target = unique_target(dir, &filename_from_url(url, type_name));
        self.fetch_to(url, &target)
    }

    /// GET `url` into exactly `target`.
    pub fn fetch_to(&self, url: &str, target: &Path) -> Result<Downloaded, TransferError> {
        let mut body = self.fetcher.open(url)?;
        stream_to_file(&mut body, target)
    }

    pub fn download_player(
        &self,
        page_url: &str,
        dir: &Path,
        stem: &str,
    ) -> Result<PathBuf, ScrapeError> {
        fs::create_dir_all(dir).map_err(|err| ScrapeError::Failed(err.to_string()))?;
        self.scraper.download(page_url, dir, stem)
    }
}

/// Copy `reader` into `target` through a temporary `.part` file, hashing as
/// it goes. The target only appears once the whole stream was written.
pub fn stream_to_file(reader: &mut dyn Read, target: &Path) -> Result<Downloaded, TransferError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let part = dir.join(format!(".{}.part", Uuid::new_v4()));

    let result = copy_hashing(reader, &part);
    let (size_bytes, sha256) = match result {
        Ok(done) => done,
        Err(err) => {
            let _ = fs::remove_file(&part);
            return Err(err);
        }
    };
    if let Err(err) = fs::rename(&part, target) {
        let _ = fs::remove_file(&part);
        return Err(err.into());
    }

    Ok(Downloaded {
        path: target.to_path_buf(),
        size_bytes,
        sha256,
    })
}

fn copy_hashing(reader: &mut dyn Read, part: &Path) -> Result<(u64, String), TransferError> {
    let mut file = File::create(part)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let read = reader
            .read(&mut buf)
            .map_err(|err| TransferError::Transport(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        file.write_all(&buf[..read])?;
        total += read as u64;
    }
    file.flush()?;
    Ok((total, format!("{:x}", hasher.finalize())))
}
