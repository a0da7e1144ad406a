//! Per-kind strategies deriving a download URL from a raw attachment record.
//!
//! Platform records nest the media body under a key named after the type
//! (`{"type": "photo", "photo": {...}}`); some producers put fields at the top
//! level instead, so every lookup checks the body first and then the record.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{ResolutionGap, VkError};
use crate::models::AttachmentKind;

/// Size letters in ascending order of resolution, used to break area ties
/// (old photos report `0x0` for every size).
const PHOTO_SIZE_ORDER: &str = "smxopqryzw";

/// Read-only metadata lookup for videos whose record carries no file map.
pub trait VideoLookup: Send + Sync {
    /// Returns the platform's video item (with `files` / `player`), if any.
    fn lookup_video(
        &self,
        owner_id: i64,
        video_id: i64,
        access_key: Option<&str>,
    ) -> Result<Option<Value>, VkError>;
}

/// Outcome of URL resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A URL fetchable with a plain GET.
    Direct(String),
    /// A player/page URL that needs the external page downloader.
    Player(String),
    /// Stickers go through the identity-keyed sticker cache.
    Sticker { sticker_id: i64, url: Option<String> },
    Gap(ResolutionGap),
}

impl Resolution {
    pub fn url(&self) -> Option<&str> {
        match self {
            Resolution::Direct(url) | Resolution::Player(url) => Some(url),
            Resolution::Sticker { url, .. } => url.as_deref(),
            Resolution::Gap(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoSize {
    pub width: i64,
    pub height: i64,
    pub url: Option<String>,
    pub size_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoFields {
    pub sizes: Vec<PhotoSize>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoFields {
    pub owner_id: Option<i64>,
    pub id: Option<i64>,
    pub access_key: Option<String>,
    pub files: Option<Map<String, Value>>,
    pub player: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioFields {
    pub link_mp3: Option<String>,
    pub link_ogg: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StickerFields {
    pub sticker_id: Option<i64>,
    pub product_id: Option<i64>,
    pub image_url: Option<String>,
}

/// Typed view over a raw attachment, selected by the `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Media {
    Photo(PhotoFields),
    Video(VideoFields),
    AudioMessage(AudioFields),
    Doc { url: Option<String> },
    Sticker(StickerFields),
    Other { type_name: String, url: Option<String> },
}

impl Media {
    pub fn from_raw(raw: &Value) -> Self {
        let type_name = type_name(raw);
        let fields = Fields::new(raw, &type_name);
        match AttachmentKind::from_type(&type_name) {
            AttachmentKind::Photo => Media::Photo(PhotoFields {
                sizes: fields
                    .array("sizes")
                    .iter()
                    .map(|size| PhotoSize {
                        width: int_value(size.get("width")).unwrap_or(0),
                        height: int_value(size.get("height")).unwrap_or(0),
                        url: string_value(size.get("url")).or_else(|| string_value(size.get("src"))),
                        size_type: string_value(size.get("type")),
                    })
                    .collect(),
                url: fields.string("url"),
            }),
            AttachmentKind::Video => Media::Video(VideoFields {
                owner_id: fields.int("owner_id"),
                id: fields.int("id"),
                access_key: fields.string("access_key"),
                files: fields.object("files"),
                player: fields.string("player"),
            }),
            AttachmentKind::AudioMessage => Media::AudioMessage(AudioFields {
                link_mp3: fields.string("link_mp3"),
                link_ogg: fields.string("link_ogg"),
            }),
            AttachmentKind::Doc => Media::Doc {
                url: fields.string("url"),
            },
            AttachmentKind::Sticker => Media::Sticker(StickerFields {
                sticker_id: fields.int("sticker_id"),
                product_id: fields.int("product_id"),
                image_url: largest_image(fields.array("images"))
                    .or_else(|| largest_image(fields.array("images_with_background"))),
            }),
            AttachmentKind::Other => Media::Other {
                url: fields.top_string("url"),
                type_name,
            },
        }
    }
}

/// Derive the best download candidate for `raw`.
///
/// Never fails: a record with no derivable URL yields [`Resolution::Gap`]
/// carrying a type-specific reason. Only videos without an embedded file map
/// touch the network, through `lookup`.
pub fn resolve(raw: &Value, lookup: &dyn VideoLookup) -> Resolution {
    match Media::from_raw(raw) {
        Media::Photo(photo) => resolve_photo(&photo),
        Media::Video(video) => resolve_video(&video, lookup),
        Media::AudioMessage(audio) => match audio.link_mp3.or(audio.link_ogg) {
            Some(url) => Resolution::Direct(url),
            None => gap("audio message has neither link_mp3 nor link_ogg"),
        },
        Media::Doc { url } => match url {
            Some(url) => Resolution::Direct(url),
            None => gap("doc has no url field"),
        },
        Media::Sticker(sticker) => match (sticker.sticker_id, sticker.image_url) {
            (Some(sticker_id), url) => Resolution::Sticker { sticker_id, url },
            (None, Some(url)) => Resolution::Direct(url),
            (None, None) => gap("sticker has no sticker_id and no image url"),
        },
        Media::Other { type_name, url } => match url {
            Some(url) => Resolution::Direct(url),
            None => gap(format!("attachment of type `{type_name}` has no url field")),
        },
    }
}

pub fn resolve_photo(photo: &PhotoFields) -> Resolution {
    let best = photo
        .sizes
        .iter()
        .filter(|size| size.url.is_some())
        .max_by_key(|size| {
            let area = size.width.max(0).saturating_mul(size.height.max(0));
            let rank = size
                .size_type
                .as_deref()
                .and_then(|letter| PHOTO_SIZE_ORDER.find(letter))
                .map(|idx| idx as i64)
                .unwrap_or(-1);
            (area, rank)
        })
        .and_then(|size| size.url.clone());
    match best.or_else(|| photo.url.clone()) {
        Some(url) => Resolution::Direct(url),
        None if photo.sizes.is_empty() => gap("photo has no sizes array and no url field"),
        None => gap("photo sizes carry no url and there is no url field"),
    }
}

pub fn resolve_video(video: &VideoFields, lookup: &dyn VideoLookup) -> Resolution {
    if let Some(files) = video.files.as_ref() {
        if let Some(url) = best_mp4(files) {
            return Resolution::Direct(url);
        }
        return match video.player.clone() {
            Some(player) => Resolution::Player(player),
            None => gap("video has a files map but no mp4 key, and no player fallback"),
        };
    }

    let mut player = video.player.clone();
    let mut looked_up = false;
    if let (Some(owner_id), Some(id)) = (video.owner_id, video.id) {
        looked_up = true;
        match lookup.lookup_video(owner_id, id, video.access_key.as_deref()) {
            Ok(Some(item)) => {
                if let Some(url) = item
                    .get("files")
                    .and_then(Value::as_object)
                    .and_then(best_mp4)
                {
                    debug!("video {owner_id}_{id}: mp4 found via metadata lookup");
                    return Resolution::Direct(url);
                }
                if player.is_none() {
                    player = string_value(item.get("player"));
                }
            }
            Ok(None) => debug!("video {owner_id}_{id}: metadata lookup returned no item"),
            Err(err) => warn!("video {owner_id}_{id}: metadata lookup failed: {err}"),
        }
    }

    match player {
        Some(player) => Resolution::Player(player),
        None if looked_up => {
            gap("video has no files map and no player fallback (metadata lookup found no mp4 variant)")
        }
        None => gap("video has no files map and no player fallback"),
    }
}

/// Highest-numbered `mp4_<N>` key, with a bare `mp4` ranking lowest.
pub fn best_mp4(files: &Map<String, Value>) -> Option<String> {
    files
        .iter()
        .filter_map(|(key, value)| {
            let url = value.as_str().map(str::trim).filter(|url| !url.is_empty())?;
            let rank = if key == "mp4" {
                0
            } else {
                key.strip_prefix("mp4_")?.parse::<u32>().ok()?
            };
            Some((rank, url.to_string()))
        })
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, url)| url)
}

pub fn type_name(raw: &Value) -> String {
    string_value(raw.get("type")).unwrap_or_else(|| "other".to_string())
}

/// `(owner_id, id, access_key)` when the record carries platform identity.
pub fn identity(raw: &Value) -> Option<(i64, i64, Option<String>)> {
    let type_name = type_name(raw);
    let fields = Fields::new(raw, &type_name);
    Some((fields.int("owner_id")?, fields.int("id")?, fields.string("access_key")))
}

/// First URL-ish field of the record, used when nothing better identifies it.
pub fn raw_url(raw: &Value) -> Option<String> {
    let type_name = type_name(raw);
    let fields = Fields::new(raw, &type_name);
    fields
        .string("url")
        .or_else(|| fields.string("link_mp3"))
        .or_else(|| fields.string("link_ogg"))
}

fn gap(reason: impl Into<String>) -> Resolution {
    Resolution::Gap(ResolutionGap::new(reason))
}

fn largest_image(images: &[Value]) -> Option<String> {
    images
        .iter()
        .filter_map(|image| {
            let url = string_value(image.get("url"))?;
            let width = int_value(image.get("width")).unwrap_or(0);
            let height = int_value(image.get("height")).unwrap_or(0);
            Some((width.saturating_mul(height), url))
        })
        .max_by_key(|(area, _)| *area)
        .map(|(_, url)| url)
}

struct Fields<'a> {
    body: Option<&'a Map<String, Value>>,
    top: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn new(raw: &'a Value, type_name: &str) -> Self {
        Self {
            body: raw.get(type_name).and_then(Value::as_object),
            top: raw.as_object(),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.body
            .and_then(|body| body.get(key))
            .filter(|value| !value.is_null())
            .or_else(|| self.top.and_then(|top| top.get(key)).filter(|value| !value.is_null()))
    }

    fn string(&self, key: &str) -> Option<String> {
        string_value(self.get(key))
    }

    /// Record-level field only, ignoring the typed body.
    fn top_string(&self, key: &str) -> Option<String> {
        string_value(self.top.and_then(|top| top.get(key)))
    }

    fn int(&self, key: &str) -> Option<i64> {
        int_value(self.get(key))
    }

    fn object(&self, key: &str) -> Option<Map<String, Value>> {
        self.get(key).and_then(Value::as_object).cloned()
    }

    fn array(&self, key: &str) -> &'a [Value] {
        self.get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn string_value(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn int_value(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|f| f as i64)),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeLookup {
        item: Option<Value>,
        calls: Mutex<Vec<(i64, i64, Option<String>)>>,
    }

    impl FakeLookup {
        fn new(item: Option<Value>) -> Self {
            Self {
                item,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl VideoLookup for FakeLookup {
        fn lookup_video(
            &self,
            owner_id: i64,
            video_id: i64,
            access_key: Option<&str>,
        ) -> Result<Option<Value>, VkError> {
            self.calls
                .lock()
                .unwrap()
                .push((owner_id, video_id, access_key.map(str::to_string)));
            Ok(self.item.clone())
        }
    }

    struct FailingLookup;

    impl VideoLookup for FailingLookup {
        fn lookup_video(&self, _: i64, _: i64, _: Option<&str>) -> Result<Option<Value>, VkError> {
            Err(VkError::Api {
                code: 15,
                message: "Access denied".to_string(),
            })
        }
    }

    #[test]
    fn photo_picks_largest_area_in_any_order() {
        let sizes = [
            json!({"width": 100, "height": 100, "url": "A"}),
            json!({"width": 400, "height": 300, "url": "B"}),
        ];
        let lookup = FakeLookup::new(None);
        for ordered in [sizes.to_vec(), sizes.iter().rev().cloned().collect()] {
            let raw = json!({"type": "photo", "photo": {"sizes": ordered}});
            assert_eq!(resolve(&raw, &lookup), Resolution::Direct("B".to_string()));
        }
    }

    #[test]
    fn photo_zero_sizes_use_type_letter() {
        let raw = json!({"type": "photo", "photo": {"sizes": [
            {"type": "w", "width": 0, "height": 0, "url": "W"},
            {"type": "s", "width": 0, "height": 0, "url": "S"},
        ]}});
        assert_eq!(resolve(&raw, &FakeLookup::new(None)), Resolution::Direct("W".to_string()));
    }

    #[test]
    fn photo_falls_back_to_top_level_url() {
        let raw = json!({"type": "photo", "url": "http://example.com/1.jpg"});
        assert_eq!(
            resolve(&raw, &FakeLookup::new(None)),
            Resolution::Direct("http://example.com/1.jpg".to_string())
        );
    }

    #[test]
    fn audio_prefers_mp3() {
        let lookup = FakeLookup::new(None);
        let both = json!({"type": "audio_message", "audio_message": {"link_ogg": "o", "link_mp3": "m"}});
        let ogg = json!({"type": "audio_message", "audio_message": {"link_ogg": "o"}});
        assert_eq!(resolve(&both, &lookup), Resolution::Direct("m".to_string()));
        assert_eq!(resolve(&ogg, &lookup), Resolution::Direct("o".to_string()));
    }

    #[test]
    fn video_picks_highest_mp4_without_lookup() {
        let lookup = FakeLookup::new(None);
        let raw = json!({"type": "video", "video": {"owner_id": 1, "id": 2, "files": {
            "mp4_240": "http://example.com/low.mp4",
            "mp4_1080": "http://example.com/full.mp4",
            "mp4_720": "http://example.com/high.mp4",
            "hls": "http://example.com/list.m3u8",
        }}});
        assert_eq!(
            resolve(&raw, &lookup),
            Resolution::Direct("http://example.com/full.mp4".to_string())
        );
        assert!(lookup.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn video_without_files_uses_lookup() {
        let lookup = FakeLookup::new(Some(json!({"files": {"mp4": "http://example.com/from_api.mp4"}})));
        let raw = json!({"type": "video", "video": {"owner_id": 1, "id": 2, "access_key": "key"}});
        assert_eq!(
            resolve(&raw, &lookup),
            Resolution::Direct("http://example.com/from_api.mp4".to_string())
        );
        assert_eq!(
            lookup.calls.lock().unwrap().as_slice(),
            &[(1, 2, Some("key".to_string()))]
        );
    }

    #[test]
    fn video_lookup_failure_falls_back_to_player() {
        let raw = json!({"type": "video", "video": {"owner_id": 1, "id": 2, "player": "https://vk.com/video_ext.php?x"}});
        assert_eq!(
            resolve(&raw, &FailingLookup),
            Resolution::Player("https://vk.com/video_ext.php?x".to_string())
        );
    }

    #[test]
    fn video_player_from_lookup_item() {
        let lookup = FakeLookup::new(Some(json!({"player": "https://vk.com/video_ext.php?api"})));
        let raw = json!({"type": "video", "video": {"owner_id": 1, "id": 2}});
        assert_eq!(
            resolve(&raw, &lookup),
            Resolution::Player("https://vk.com/video_ext.php?api".to_string())
        );
    }

    #[test]
    fn video_gaps_explain_what_was_absent() {
        let lookup = FakeLookup::new(None);
        let bare = json!({"type": "video", "video": {}});
        let Resolution::Gap(gap) = resolve(&bare, &lookup) else {
            panic!("expected gap");
        };
        assert!(gap.reason.contains("no files map"));
        assert!(gap.reason.contains("no player"));

        let hls_only = json!({"type": "video", "video": {"files": {"hls": "x"}}});
        let Resolution::Gap(gap) = resolve(&hls_only, &lookup) else {
            panic!("expected gap");
        };
        assert!(gap.reason.contains("files map but no mp4 key"));
    }

    #[test]
    fn sticker_resolves_by_identity() {
        let raw = json!({"type": "sticker", "sticker": {"sticker_id": 500, "product_id": 7, "images": [
            {"url": "small", "width": 64, "height": 64},
            {"url": "big", "width": 512, "height": 512},
        ]}});
        assert_eq!(
            resolve(&raw, &FakeLookup::new(None)),
            Resolution::Sticker {
                sticker_id: 500,
                url: Some("big".to_string())
            }
        );
    }

    #[test]
    fn other_kinds_only_take_a_top_level_url() {
        let lookup = FakeLookup::new(None);
        let link = json!({"type": "link", "link": {"url": "https://news.example.com/article"}});
        let Resolution::Gap(gap) = resolve(&link, &lookup) else {
            panic!("link body url must not be fetched");
        };
        assert!(gap.reason.contains("`link`"));

        let graffiti = json!({"type": "graffiti", "url": "https://cdn.example.com/g.png"});
        assert_eq!(
            resolve(&graffiti, &lookup),
            Resolution::Direct("https://cdn.example.com/g.png".to_string())
        );
    }

    #[test]
    fn malformed_records_are_silent_gaps() {
        let lookup = FakeLookup::new(None);
        for raw in [
            json!(null),
            json!("photo"),
            json!({"type": 5}),
            json!({"type": "photo", "photo": {"sizes": "nope"}}),
            json!({"type": "doc", "doc": []}),
            json!({"type": "wall"}),
        ] {
            assert!(matches!(resolve(&raw, &lookup), Resolution::Gap(_)), "{raw}");
        }
    }

    #[test]
    fn identity_reads_nested_body() {
        let raw = json!({"type": "photo", "photo": {"owner_id": "-5", "id": 9, "access_key": "k"}});
        assert_eq!(identity(&raw), Some((-5, 9, Some("k".to_string()))));
        assert_eq!(identity(&json!({"type": "sticker", "sticker": {"sticker_id": 1}})), None);
    }
}
