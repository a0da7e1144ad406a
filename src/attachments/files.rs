//! Filename and path helpers for the attachment cache.

use std::path::{Component, Path, PathBuf};

const MAX_NAME_LEN: usize = 120;

/// Keep only `[A-Za-z0-9._-]`, collapse everything else to `_`.
pub fn sanitize_filename(input: &str) -> String {
    let trimmed = input.trim().trim_matches('"').trim_matches('\'');
    let cleaned: String = trimmed
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => ch,
            _ => '_',
        })
        .take(MAX_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.chars().all(|ch| ch == '_') {
        return String::new();
    }
    cleaned
}

/// Last non-empty path segment of `url`, sanitized; `file_<type>` when empty.
pub fn filename_from_url(url: &str, type_name: &str) -> String {
    let segment = reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.filter(|item| !item.is_empty()).last())
                .map(decode_url_component_lossy)
        })
        .map(|name| sanitize_filename(&name))
        .unwrap_or_default();
    if segment.is_empty() {
        let fallback = sanitize_filename(type_name);
        if fallback.is_empty() {
            return "file_attachment".to_string();
        }
        return format!("file_{fallback}");
    }
    segment
}

/// Lowercased extension of the URL path, empty when there is none.
pub fn extract_url_extension(url: &str) -> String {
    let path = reqwest::Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| {
            let clean = url.split('?').next().unwrap_or(url);
            clean.split('#').next().unwrap_or(clean).to_string()
        });
    let last = path.rsplit('/').next().unwrap_or_default();
    let Some((_, ext)) = last.rsplit_once('.') else {
        return String::new();
    };
    let ext = ext.to_lowercase();
    if !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return ext;
    }
    String::new()
}

/// `dir/name`, or `dir/stem_N.ext` when `name` is already taken.
pub fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (name, String::new()),
    };
    let mut idx = 1;
    loop {
        let candidate = dir.join(format!("{stem}_{idx}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        idx += 1;
    }
}

/// Resolve `requested` (a path relative to `root`) to a file strictly inside
/// `root`. Returns `None` for traversal attempts, absolute paths, or paths
/// that escape the root through symlinks.
pub fn resolve_inside_root(root: &Path, requested: &str) -> Option<PathBuf> {
    let relative = Path::new(requested);
    if requested.contains('\0') {
        return None;
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return None,
        }
    }
    let candidate = root.join(relative);
    let canonical_root = root.canonicalize().ok()?;
    match candidate.canonicalize() {
        Ok(canonical) if canonical.starts_with(&canonical_root) && canonical != canonical_root => {
            Some(canonical)
        }
        Ok(_) => None,
        // Not on disk yet: the lexical check above already keeps it under root.
        Err(_) => Some(candidate),
    }
}

/// Path of `local` relative to `root`, with `/` separators, if it lies inside.
pub fn relative_to_root(root: &Path, local: &Path) -> Option<String> {
    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let canonical_local = local.canonicalize().unwrap_or_else(|_| local.to_path_buf());
    let rel = canonical_local
        .strip_prefix(&canonical_root)
        .or_else(|_| local.strip_prefix(root))
        .ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn hex_to_u8(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(10 + byte - b'a'),
        b'A'..=b'F' => Some(10 + byte - b'A'),
        _ => None,
    }
}

fn decode_url_component_lossy(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_to_u8(bytes[idx + 1]), hex_to_u8(bytes[idx + 2]))
            {
                out.push((high << 4) | low);
                idx += 3;
                continue;
            }
        }
        out.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}
