//! Static file cache: a read-mostly map from URL path to a pre-framed
//! HTTP response with lazy expiry.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;
use walkdir::WalkDir;

use crate::mime;
use crate::response::HttpResponse;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    expiry: Option<Instant>,
}

/// Read-mostly `path → (bytes, expiry)` map consulted by HTTP GET sessions.
/// Cloning is cheap and shares the cache.
#[derive(Clone, Default)]
pub struct FileCache {
    entries: Arc<RwLock<std::collections::HashMap<String, CacheEntry>>>,
}

impl FileCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including not-yet-collected expired ones.
    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    /// Store `value` under `key`; `None` means no expiry.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Bytes>, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value: value.into(),
            expiry: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.write().insert(key.into(), entry);
    }

    /// Fetch the value under `key`, skipping (and collecting) expired
    /// entries.
    pub fn find(&self, key: &str) -> Option<Bytes> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if !Self::expired(entry) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: take the write lock and collect it.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if Self::expired(entry) {
                entries.remove(key);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    /// Remove the entry under `key`.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Recursively walk `root` and insert each file under
    /// `<prefix>/<relative path>` as a fully framed 200 response with the
    /// inferred content type and a matching `Cache-Control` header.
    pub fn insert_path(
        &self,
        prefix: &str,
        root: impl AsRef<Path>,
        ttl: Option<Duration>,
    ) -> io::Result<usize> {
        self.insert_path_with(prefix, root, ttl, |path, content, ttl| {
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or_default();
            let mut response = HttpResponse::new();
            response
                .set_begin(200)
                .set_header("Content-Type", mime::content_type(extension));
            if let Some(ttl) = ttl {
                response.set_header("Cache-Control", &format!("max-age={}", ttl.as_secs()));
            }
            response.set_body(&content);
            response.cache().to_vec()
        })
    }

    /// As [`insert_path`](Self::insert_path) with a custom loader framing
    /// each file's bytes into the stored value.
    pub fn insert_path_with(
        &self,
        prefix: &str,
        root: impl AsRef<Path>,
        ttl: Option<Duration>,
        loader: impl Fn(&Path, Vec<u8>, Option<Duration>) -> Vec<u8>,
    ) -> io::Result<usize> {
        let root = root.as_ref();
        let prefix = prefix.trim_end_matches('/');
        let mut inserted = 0;

        for entry in WalkDir::new(root) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(io::Error::other)?
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let key = format!("{prefix}/{relative}");
            let content = std::fs::read(entry.path())?;
            let framed = loader(entry.path(), content, ttl);
            debug!(%key, size = framed.len(), "cached static file");
            self.insert(key, framed, ttl);
            inserted += 1;
        }
        Ok(inserted)
    }
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("entries", &self.size())
            .finish()
    }
}

impl FileCache {
    fn expired(entry: &CacheEntry) -> bool {
        entry
            .expiry
            .is_some_and(|expiry| Instant::now() > expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let cache = FileCache::new();
        cache.insert("/k", &b"v"[..], None);
        assert_eq!(cache.find("/k").as_deref(), Some(&b"v"[..]));
        assert!(cache.remove("/k"));
        assert_eq!(cache.find("/k"), None);
    }

    #[test]
    fn test_expiry_is_lazy() {
        let cache = FileCache::new();
        cache.insert("/k", &b"v"[..], Some(Duration::from_millis(20)));
        assert!(cache.find("/k").is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.size(), 1);
        // The expired entry is collected on lookup.
        assert_eq!(cache.find("/k"), None);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_insert_path_frames_responses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<html></html>").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), b"body{}").unwrap();

        let cache = FileCache::new();
        let inserted = cache
            .insert_path("/static", dir.path(), Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(inserted, 2);

        let framed = cache.find("/static/index.html").unwrap();
        let mut response = HttpResponse::new();
        assert!(response.receive_header(&framed));
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.header_value("Content-Type"),
            Some("text/html; charset=UTF-8")
        );
        assert_eq!(response.header_value("Cache-Control"), Some("max-age=60"));
        assert_eq!(response.body(), b"<html></html>");

        assert!(cache.find("/static/css/site.css").is_some());
    }
}
