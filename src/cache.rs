use crate::parser::ParsedTemplate;
use crate::path::mtime_epoch;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bumping this invalidates every stored entry transparently.
pub const CACHE_VERSION: &str = "utpl-1";

/// Disk format of one compiled template. Plain structured data,
/// deserialized and never executed.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    version: String,
    template_path: String,
    compiled_at: u64,
    dependency_timestamps: BTreeMap<String, u64>,
    tags: Vec<String>,
    template: ParsedTemplate,
}

#[derive(Debug, Serialize, Deserialize)]
struct FragmentEntry {
    content: String,
    expires_at: u64,
}

#[derive(Clone)]
struct HotEntry {
    template: Arc<ParsedTemplate>,
    dependency_timestamps: BTreeMap<String, u64>,
    tags: Vec<String>,
}

/// Disk-backed compiled-template cache with an in-memory hot layer, plus an
/// independent short-TTL fragment cache. Every failure on this boundary is
/// recovered locally: corrupt or stale entries read as a miss, write
/// failures are logged and swallowed. Writes are temp-file-then-rename so
/// concurrent readers never observe a torn entry.
pub struct TemplateCache {
    dir: PathBuf,
    hot: DashMap<String, HotEntry>,
}

impl TemplateCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cache directory not creatable, caching disabled");
        }
        Self {
            dir,
            hot: DashMap::new(),
        }
    }

    /// True iff an entry exists, its version matches, and every recorded
    /// dependency still exists with an mtime no newer than at store time.
    pub fn is_valid(&self, name: &str) -> bool {
        if let Some(hot) = self.hot.get(name) {
            return deps_valid(&hot.dependency_timestamps);
        }
        match self.read_entry(name) {
            Some(entry) => deps_valid(&entry.dependency_timestamps),
            None => false,
        }
    }

    /// Returns the compiled template when the entry is present and still
    /// valid; any corruption or staleness reads as None.
    pub fn load(&self, name: &str) -> Option<Arc<ParsedTemplate>> {
        if let Some(hot) = self.hot.get(name) {
            if deps_valid(&hot.dependency_timestamps) {
                return Some(Arc::clone(&hot.template));
            }
            drop(hot);
            self.hot.remove(name);
        }

        let entry = self.read_entry(name)?;
        if !deps_valid(&entry.dependency_timestamps) {
            return None;
        }
        let template = Arc::new(entry.template);
        self.hot.insert(
            name.to_string(),
            HotEntry {
                template: Arc::clone(&template),
                dependency_timestamps: entry.dependency_timestamps,
                tags: entry.tags,
            },
        );
        Some(template)
    }

    /// Serializes and stores a compiled template, capturing current
    /// dependency mtimes. Caching is an optimization: failures are logged,
    /// never surfaced.
    pub fn store(&self, name: &str, template: &ParsedTemplate, tags: &[String]) {
        let mut dependency_timestamps = BTreeMap::new();
        for dep in &template.dependencies {
            match mtime_epoch(Path::new(dep)) {
                Some(mtime) => {
                    dependency_timestamps.insert(dep.clone(), mtime);
                }
                None => {
                    warn!(template = name, dep = %dep, "dependency unreadable, skipping cache store");
                    return;
                }
            }
        }

        let entry = CacheEntry {
            version: CACHE_VERSION.to_string(),
            template_path: template.template_path.clone(),
            compiled_at: now_epoch(),
            dependency_timestamps: dependency_timestamps.clone(),
            tags: tags.to_vec(),
            template: template.clone(),
        };

        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(e) = atomic_write(&self.entry_path(name), &bytes) {
                    warn!(template = name, error = %e, "cache write failed");
                    return;
                }
            }
            Err(e) => {
                warn!(template = name, error = %e, "cache serialization failed");
                return;
            }
        }

        self.hot.insert(
            name.to_string(),
            HotEntry {
                template: Arc::new(template.clone()),
                dependency_timestamps,
                tags: tags.to_vec(),
            },
        );
        debug!(template = name, "cache entry stored");
    }

    /// Removes one entry. Returns true when something was removed.
    pub fn remove(&self, name: &str) -> bool {
        let had_hot = self.hot.remove(name).is_some();
        let had_disk = std::fs::remove_file(self.entry_path(name)).is_ok();
        had_hot || had_disk
    }

    /// Sweeps the whole cache directory (templates and fragments).
    pub fn clear_all(&self) -> bool {
        self.hot.clear();
        let mut ok = true;
        for entry in walkdir::WalkDir::new(&self.dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "cache file removal failed");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Removes every template entry carrying the given tag.
    pub fn invalidate_by_tag(&self, tag: &str) {
        self.hot.retain(|_, hot| !hot.tags.iter().any(|t| t == tag));

        for entry in walkdir::WalkDir::new(&self.dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || !path.to_string_lossy().ends_with(".tpl.json") {
                continue;
            }
            let tagged = std::fs::read(path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<CacheEntry>(&bytes).ok())
                .map(|e| e.tags.iter().any(|t| t == tag))
                .unwrap_or(false);
            if tagged {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %e, "tagged entry removal failed");
                }
            }
        }
    }

    /// Fragment cache: lazy expiry on read, expired entries removed.
    pub fn get_fragment(&self, key: &str) -> Option<String> {
        let path = self.fragment_path(key);
        let bytes = std::fs::read(&path).ok()?;
        let entry: FragmentEntry = match serde_json::from_slice(&bytes) {
            Ok(e) => e,
            Err(_) => {
                let _ = std::fs::remove_file(&path);
                return None;
            }
        };
        if entry.expires_at <= now_epoch() {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(entry.content)
    }

    pub fn store_fragment(&self, key: &str, content: &str, ttl_seconds: u64) {
        if ttl_seconds == 0 {
            return;
        }
        let entry = FragmentEntry {
            content: content.to_string(),
            expires_at: now_epoch() + ttl_seconds,
        };
        match serde_json::to_vec(&entry) {
            Ok(bytes) => {
                if let Err(e) = atomic_write(&self.fragment_path(key), &bytes) {
                    warn!(key, error = %e, "fragment write failed");
                }
            }
            Err(e) => warn!(key, error = %e, "fragment serialization failed"),
        }
    }

    fn read_entry(&self, name: &str) -> Option<CacheEntry> {
        let bytes = std::fs::read(self.entry_path(name)).ok()?;
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(e) => e,
            Err(e) => {
                // Corruption or schema drift degrades to a re-parse.
                debug!(template = name, error = %e, "cache entry unreadable, treating as miss");
                return None;
            }
        };
        if entry.version != CACHE_VERSION {
            return None;
        }
        Some(entry)
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{:016x}.tpl.json", hash_key(name)))
    }

    fn fragment_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{:016x}.frag.json", hash_key(key)))
    }
}

fn hash_key(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn deps_valid(stamps: &BTreeMap<String, u64>) -> bool {
    stamps.iter().all(|(path, recorded)| {
        matches!(mtime_epoch(Path::new(path)), Some(current) if current <= *recorded)
    })
}

/// Write-temp-then-rename so readers never see a partial entry. A lost race
/// between two writers is fine; recompilation is idempotent.
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!(
        "tmp.{}.{}",
        std::process::id(),
        now_epoch()
    ));
    std::fs::write(&tmp, bytes)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}
