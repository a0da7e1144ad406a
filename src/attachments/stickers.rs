//! Identity-keyed sticker image cache.
//!
//! Stickers are immutable and identical across every message that uses them,
//! so they are stored once per `sticker_id` under the cache directory and
//! never evicted.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::download::{stream_to_file, HttpFetch};
use super::files::extract_url_extension;
use crate::error::CacheMissError;

const STICKER_BASE_URL: &str = "https://vk.com/sticker/1-";
const STICKER_SIZES: [u32; 3] = [512, 256, 128];
const DEFAULT_EXTENSION: &str = "png";

/// Ordered download candidates: the caller's URL first, then constructed
/// URLs at decreasing resolution, each without and with a background.
pub fn sticker_candidates(sticker_id: i64, supplied: Option<&str>) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();
    if let Some(url) = supplied.map(str::trim).filter(|url| !url.is_empty()) {
        candidates.push(url.to_string());
    }
    for size in STICKER_SIZES {
        for suffix in ["", "b"] {
            let url = format!("{STICKER_BASE_URL}{sticker_id}-{size}{suffix}");
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }
    }
    candidates
}

pub struct StickerCache {
    dir: PathBuf,
    fetcher: Arc<dyn HttpFetch>,
}

impl StickerCache {
    pub fn new(dir: PathBuf, fetcher: Arc<dyn HttpFetch>) -> Self {
        Self { dir, fetcher }
    }

    /// An already cached `sticker_<id>.*` file, if present.
    pub fn cached_path(&self, sticker_id: i64) -> Option<PathBuf> {
        let stem = file_stem(sticker_id);
        let entries = fs::read_dir(&self.dir).ok()?;
        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .find(|path| {
                path.is_file() && path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str())
            })
    }

    /// Return the cached file for `sticker_id`, fetching it on first use.
    pub fn materialize(
        &self,
        sticker_id: i64,
        candidate_url: Option<&str>,
    ) -> Result<PathBuf, CacheMissError> {
        if let Some(path) = self.cached_path(sticker_id) {
            debug!("sticker {sticker_id}: cache hit {}", path.display());
            return Ok(path);
        }

        let candidates = sticker_candidates(sticker_id, candidate_url);
        let mut last_error = String::from("no candidates");
        if let Err(err) = fs::create_dir_all(&self.dir) {
            return Err(CacheMissError {
                sticker_id,
                attempts: 0,
                last_error: err.to_string(),
            });
        }

        for url in &candidates {
            let ext = match extract_url_extension(url) {
                ext if ext.is_empty() => DEFAULT_EXTENSION.to_string(),
                ext => ext,
            };
            let target = self.dir.join(format!("{}.{ext}", file_stem(sticker_id)));
            let attempt = self
                .fetcher
                .open(url)
                .and_then(|mut body| stream_to_file(&mut body, &target));
            match attempt {
                Ok(done) => {
                    info!("sticker {sticker_id}: cached from {url}");
                    return Ok(done.path);
                }
                Err(err) => {
                    debug!("sticker {sticker_id}: candidate {url} failed: {err}");
                    last_error = err.to_string();
                }
            }
        }

        Err(CacheMissError {
            sticker_id,
            attempts: candidates.len(),
            last_error,
        })
    }
}

fn file_stem(sticker_id: i64) -> String {
    format!("sticker_{sticker_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use std::io::{Cursor, Read};
    use std::sync::Mutex;

    /// Serves `body` for URLs in `ok`, 404 for everything else.
    struct ScriptedFetcher {
        ok: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(ok: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                ok: ok.iter().map(|url| url.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl HttpFetch for ScriptedFetcher {
        fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, TransferError> {
            self.calls.lock().unwrap().push(url.to_string());
            if self.ok.iter().any(|ok| ok == url) {
                return Ok(Box::new(Cursor::new(b"sticker".to_vec())));
            }
            Err(TransferError::Status {
                code: 404,
                reason: "Not Found".to_string(),
            })
        }
    }

    #[test]
    fn candidates_start_with_supplied_then_descend() {
        let list = sticker_candidates(500, Some("https://cdn.example.com/s/500.png"));
        assert_eq!(
            list,
            vec![
                "https://cdn.example.com/s/500.png",
                "https://vk.com/sticker/1-500-512",
                "https://vk.com/sticker/1-500-512b",
                "https://vk.com/sticker/1-500-256",
                "https://vk.com/sticker/1-500-256b",
                "https://vk.com/sticker/1-500-128",
                "https://vk.com/sticker/1-500-128b",
            ]
        );
        assert_eq!(sticker_candidates(500, None).len(), 6);
        assert_eq!(
            sticker_candidates(500, Some("https://vk.com/sticker/1-500-512")).len(),
            6
        );
    }

    #[test]
    fn second_request_is_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(&["https://cdn.example.com/s/500.webp"]);
        let cache = StickerCache::new(dir.path().join("stickers"), fetcher.clone());

        let first = cache
            .materialize(500, Some("https://cdn.example.com/s/500.webp"))
            .unwrap();
        assert_eq!(first.file_name().unwrap(), "sticker_500.webp");
        let second = cache.materialize(500, None).unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[test]
    fn falls_through_to_constructed_urls() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(&["https://vk.com/sticker/1-9-256b"]);
        let cache = StickerCache::new(dir.path().to_path_buf(), fetcher.clone());

        let path = cache.materialize(9, Some("https://broken.example.com/9.png")).unwrap();
        assert_eq!(path.file_name().unwrap(), "sticker_9.png");
        assert_eq!(fetcher.calls().len(), 5);
    }

    #[test]
    fn exhausted_candidates_report_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::new(&[]);
        let cache = StickerCache::new(dir.path().to_path_buf(), fetcher);

        let err = cache.materialize(77, None).unwrap_err();
        assert_eq!(err.attempts, 6);
        assert!(err.to_string().contains("HTTP 404"));
        assert!(cache.cached_path(77).is_none());
    }

    #[test]
    fn cache_lookup_does_not_match_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sticker_50.png"), b"x").unwrap();
        let cache = StickerCache::new(dir.path().to_path_buf(), ScriptedFetcher::new(&[]));
        assert!(cache.cached_path(5).is_none());
        assert!(cache.cached_path(50).is_some());
    }
}
