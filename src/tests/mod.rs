
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::attachments::download::{Downloader, HttpFetch, PageDownloader};
use crate::attachments::resolve::VideoLookup;
use crate::attachments::stickers::StickerCache;
use crate::attachments::AttachmentPipeline;
use crate::db::EventLog;
use crate::error::{ScrapeError, TransferError, VkError};

/// Serves the URL itself as the body; URLs listed in `failing` answer with
/// the given status code.
#[derive(Default)]
pub struct RecordingFetcher {
    failing: HashMap<String, u16>,
    calls: Mutex<Vec<String>>,
}

impl RecordingFetcher {
    pub fn failing(mut self, url: &str, code: u16) -> Self {
        self.failing.insert(url.to_string(), code);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl HttpFetch for RecordingFetcher {
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, TransferError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(code) = self.failing.get(url) {
            return Err(TransferError::Status {
                code: *code,
                reason: "Internal Server Error".to_string(),
            });
        }
        Ok(Box::new(Cursor::new(url.as_bytes().to_vec())))
    }
}

/// `video.get` answers keyed by `owner_id_id`.
#[derive(Default)]
pub struct TableLookup {
    items: HashMap<String, Value>,
    calls: Mutex<Vec<String>>,
}

impl TableLookup {
    pub fn with(mut self, owner_id: i64, video_id: i64, item: Value) -> Self {
        self.items.insert(format!("{owner_id}_{video_id}"), item);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl VideoLookup for TableLookup {
    fn lookup_video(
        &self,
        owner_id: i64,
        video_id: i64,
        access_key: Option<&str>,
    ) -> Result<Option<Value>, VkError> {
        let key = format!("{owner_id}_{video_id}");
        self.calls
            .lock()
            .unwrap()
            .push(format!("{key}_{}", access_key.unwrap_or_default()));
        Ok(self.items.get(&key).cloned())
    }
}

pub enum ScrapeBehavior {
    Writes(&'static str),
    Restricted,
    NotInstalled,
}

pub struct FakeScraper {
    behavior: ScrapeBehavior,
    calls: Mutex<Vec<String>>,
}

impl FakeScraper {
    pub fn new(behavior: ScrapeBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl PageDownloader for FakeScraper {
    fn download(&self, page_url: &str, target_dir: &Path, stem: &str) -> Result<PathBuf, ScrapeError> {
        self.calls.lock().unwrap().push(page_url.to_string());
        match self.behavior {
            ScrapeBehavior::Writes(ext) => {
                let path = target_dir.join(format!("{stem}.{ext}"));
                fs::write(&path, b"scraped")
                    .map_err(|err| ScrapeError::Failed(err.to_string()))?;
                Ok(path)
            }
            ScrapeBehavior::Restricted => Err(ScrapeError::AccessRestricted(
                "ERROR: [vk] This video is only available for registered users".to_string(),
            )),
            ScrapeBehavior::NotInstalled => Err(ScrapeError::Unavailable("yt-dlp".to_string())),
        }
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub root: PathBuf,
    pub fetcher: Arc<RecordingFetcher>,
    pub lookup: Arc<TableLookup>,
    pub scraper: Arc<FakeScraper>,
    pub pipeline: AttachmentPipeline,
    pub log: EventLog,
}

impl Harness {
    pub fn new(fetcher: RecordingFetcher, lookup: TableLookup, scraper: ScrapeBehavior) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("attachments");
        let fetcher = Arc::new(fetcher);
        let lookup = Arc::new(lookup);
        let scraper = Arc::new(FakeScraper::new(scraper));
        let pipeline = AttachmentPipeline::new(
            root.clone(),
            lookup.clone(),
            Downloader::new(fetcher.clone(), scraper.clone()),
            StickerCache::new(root.join("stickers"), fetcher.clone()),
        );
        let log = EventLog::open(dir.path().join("logs.db")).unwrap();
        Self {
            dir,
            root,
            fetcher,
            lookup,
            scraper,
            pipeline,
            log,
        }
    }

    pub fn offline() -> Self {
        Self::new(
            RecordingFetcher::default(),
            TableLookup::default(),
            ScrapeBehavior::NotInstalled,
        )
    }
}
