//! Tag cache: a small embedded key-value store of recently observed registry
//! tags.
//!
//! Records live under `TagInfo:<image>:<hash>:<tag>` with a JSON encoded
//! [`TagInfo`] value and a time-to-live. Three secondary indexes (image,
//! created, tag) keep point queries ordered by push time. Expiry is passive:
//! queries ignore expired records and writes evict them, nothing runs on a
//! timer. Every public method is one read or write transaction on the
//! keyspace.

use crate::metrics::CACHE_ENTRIES;
use crate::models::TagInfo;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long an observed tag stays visible without being re-scanned
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache location that keeps everything in memory
pub const IN_MEMORY: &str = ":memory:";

/// Index position: push time, then insertion sequence, then key
type Position = (DateTime<Utc>, u64, String);

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: DateTime<Utc>,
    position: Position,
    image: String,
    tag: String,
}

impl Record {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    records: HashMap<String, Record>,
    by_image: BTreeMap<String, BTreeSet<Position>>,
    by_created: BTreeSet<Position>,
    by_tag: BTreeMap<String, BTreeSet<Position>>,
    by_expiry: BTreeSet<(DateTime<Utc>, String)>,
    next_seq: u64,
}

impl Keyspace {
    fn insert(&mut self, key: String, info: &TagInfo, value: String, expires_at: DateTime<Utc>) {
        self.remove(&key);

        let position = (info.created, self.next_seq, key.clone());
        self.next_seq += 1;

        self.by_image
            .entry(info.image.clone())
            .or_default()
            .insert(position.clone());
        self.by_tag
            .entry(info.tag.clone())
            .or_default()
            .insert(position.clone());
        self.by_created.insert(position.clone());
        self.by_expiry.insert((expires_at, key.clone()));

        self.records.insert(
            key,
            Record {
                value,
                expires_at,
                position,
                image: info.image.clone(),
                tag: info.tag.clone(),
            },
        );
    }

    fn remove(&mut self, key: &str) -> Option<Record> {
        let record = self.records.remove(key)?;

        if let Some(set) = self.by_image.get_mut(&record.image) {
            set.remove(&record.position);
            if set.is_empty() {
                self.by_image.remove(&record.image);
            }
        }
        if let Some(set) = self.by_tag.get_mut(&record.tag) {
            set.remove(&record.position);
            if set.is_empty() {
                self.by_tag.remove(&record.tag);
            }
        }
        self.by_created.remove(&record.position);
        self.by_expiry
            .remove(&(record.expires_at, key.to_string()));

        Some(record)
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some((expires_at, key)) = self.by_expiry.first().cloned() {
            if expires_at > now {
                break;
            }
            self.remove(&key);
            evicted += 1;
        }
        evicted
    }

    fn live_count(&self, now: DateTime<Utc>) -> usize {
        self.records.values().filter(|r| r.is_live(now)).count()
    }

    /// Decode live records in the given (ascending) positions, newest first
    fn collect_desc<'a>(
        &self,
        positions: impl DoubleEndedIterator<Item = &'a Position>,
        now: DateTime<Utc>,
    ) -> Vec<TagInfo> {
        positions
            .rev()
            .filter_map(|(_, _, key)| self.records.get(key).map(|record| (key, record)))
            .filter(|(_, record)| record.is_live(now))
            .filter_map(|(key, record)| match decode(&record.value) {
                Ok(info) => Some(info),
                Err(e) => {
                    error!("Skipping undecodable cache record {}: {}", key, e);
                    None
                },
            })
            .collect()
    }
}

fn decode(value: &str) -> Result<TagInfo> {
    serde_json::from_str(value).context("cache value is not a TagInfo")
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One line of the on-disk snapshot
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotLine {
    key: String,
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct TagCache {
    space: RwLock<Keyspace>,
    ttl: Duration,
    location: Option<PathBuf>,
}

impl TagCache {
    pub fn in_memory() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            space: RwLock::new(Keyspace::default()),
            ttl,
            location: None,
        }
    }

    /// Open a cache at `location`: either [`IN_MEMORY`] or a snapshot file.
    ///
    /// A missing snapshot starts an empty cache. Expired or malformed lines
    /// are skipped.
    pub fn open(location: &str) -> Result<Self> {
        if location == IN_MEMORY {
            debug!("Cache initialised in memory");
            return Ok(Self::in_memory());
        }

        let path = PathBuf::from(location);
        let mut cache = Self::in_memory();
        cache.location = Some(path.clone());

        if path.exists() {
            let loaded = cache.load_snapshot(&path)?;
            info!("Loaded {} cached tags from {}", loaded, path.display());
        } else {
            debug!("Cache snapshot {} does not exist yet", path.display());
        }

        Ok(cache)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Upsert a tag, resetting its TTL
    pub fn put(&self, info: &TagInfo) -> Result<()> {
        self.put_many(std::slice::from_ref(info))
    }

    /// Upsert a tag with an explicit TTL
    pub fn put_with_ttl(&self, info: &TagInfo, ttl: Duration) -> Result<()> {
        self.write_batch(std::slice::from_ref(info), ttl, Utc::now())
    }

    /// Upsert a batch of tags in a single write transaction
    pub fn put_many(&self, infos: &[TagInfo]) -> Result<()> {
        self.write_batch(infos, self.ttl, Utc::now())
    }

    fn write_batch(&self, infos: &[TagInfo], ttl: Duration, now: DateTime<Utc>) -> Result<()> {
        let encoded = infos
            .iter()
            .map(|info| Ok((info.storage_key(), serde_json::to_string(info)?)))
            .collect::<Result<Vec<_>, serde_json::Error>>()
            .context("Failed to encode tag info")?;

        let mut space = self
            .space
            .write()
            .map_err(|_| anyhow!("tag cache lock poisoned"))?;

        let evicted = space.evict_expired(now);
        if evicted > 0 {
            debug!("Evicted {} expired cache records", evicted);
        }

        let expires_at = expiry(now, ttl);
        for (info, (key, value)) in infos.iter().zip(encoded) {
            space.insert(key, info, value, expires_at);
        }

        CACHE_ENTRIES.set(space.live_count(now) as i64);
        Ok(())
    }

    /// Live entry by storage key
    pub fn get(&self, key: &str) -> Option<TagInfo> {
        let space = self.read()?;
        let record = space.records.get(key)?;
        if !record.is_live(Utc::now()) {
            return None;
        }
        decode(&record.value)
            .map_err(|e| error!("Skipping undecodable cache record {}: {}", key, e))
            .ok()
    }

    /// All live tags of `image`, newest first
    pub fn query_by_image(&self, image: &str) -> Vec<TagInfo> {
        let Some(space) = self.read() else {
            return Vec::new();
        };
        let result = match space.by_image.get(image) {
            Some(positions) => space.collect_desc(positions.iter(), Utc::now()),
            None => Vec::new(),
        };
        debug!("Searched cache for {}: {} hits", image, result.len());
        result
    }

    /// All live entries carrying `tag`, newest first
    pub fn query_by_tag(&self, tag: &str) -> Vec<TagInfo> {
        let Some(space) = self.read() else {
            return Vec::new();
        };
        match space.by_tag.get(tag) {
            Some(positions) => space.collect_desc(positions.iter(), Utc::now()),
            None => Vec::new(),
        }
    }

    /// Every live entry, newest first
    pub fn newest(&self) -> Vec<TagInfo> {
        let Some(space) = self.read() else {
            return Vec::new();
        };
        space.collect_desc(space.by_created.iter(), Utc::now())
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.read()
            .map(|space| space.live_count(now))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the live keyspace to the snapshot file, if the cache has one
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.location else {
            return Ok(());
        };

        let now = Utc::now();
        let lines = {
            let space = self
                .space
                .read()
                .map_err(|_| anyhow!("tag cache lock poisoned"))?;
            space
                .records
                .iter()
                .filter(|(_, record)| record.is_live(now))
                .map(|(key, record)| {
                    serde_json::to_string(&SnapshotLine {
                        key: key.clone(),
                        value: record.value.clone(),
                        expires_at: record.expires_at,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create snapshot next to {}", path.display()))?;
        for line in &lines {
            writeln!(tmp, "{}", line)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write cache snapshot {}", path.display()))?;

        debug!("Saved {} cached tags to {}", lines.len(), path.display());
        Ok(())
    }

    fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache snapshot {}", path.display()))?;

        let now = Utc::now();
        let mut space = self
            .space
            .write()
            .map_err(|_| anyhow!("tag cache lock poisoned"))?;

        let mut loaded = 0;
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SnapshotLine = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping malformed snapshot line {}: {}", number + 1, e);
                    continue;
                },
            };
            if entry.expires_at <= now {
                continue;
            }
            let info = match decode(&entry.value) {
                Ok(info) => info,
                Err(e) => {
                    warn!("Skipping snapshot record {}: {}", entry.key, e);
                    continue;
                },
            };
            space.insert(entry.key, &info, entry.value, entry.expires_at);
            loaded += 1;
        }

        CACHE_ENTRIES.set(space.live_count(now) as i64);
        Ok(loaded)
    }

    fn read(&self) -> Option<std::sync::RwLockReadGuard<'_, Keyspace>> {
        match self.space.read() {
            Ok(guard) => Some(guard),
            Err(e) => {
                error!("Tag cache read failed: {}", e);
                None
            },
        }
    }
}

impl Default for TagCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn tag(image: &str, name: &str, minutes_ago: i64) -> TagInfo {
        TagInfo {
            image: image.to_string(),
            hash: format!("sha-{}", name),
            created: Utc::now() - ChronoDuration::minutes(minutes_ago),
            tag: name.to_string(),
        }
    }

    #[test]
    fn test_query_by_image_newest_first() {
        let cache = TagCache::in_memory();
        cache.put(&tag("gcr.io/acme/app", "develop-100", 30)).unwrap();
        cache.put(&tag("gcr.io/acme/app", "develop-300", 1)).unwrap();
        cache.put(&tag("gcr.io/acme/app", "develop-200", 10)).unwrap();
        cache.put(&tag("gcr.io/acme/other", "develop-999", 0)).unwrap();

        let tags: Vec<String> = cache
            .query_by_image("gcr.io/acme/app")
            .into_iter()
            .map(|t| t.tag)
            .collect();
        assert_eq!(tags, vec!["develop-300", "develop-200", "develop-100"]);
        assert!(cache.query_by_image("gcr.io/acme/missing").is_empty());
    }

    #[test]
    fn test_put_is_an_upsert() {
        let cache = TagCache::in_memory();
        let info = tag("gcr.io/acme/app", "develop-100", 5);
        cache.put(&info).unwrap();
        cache.put(&info).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&info.storage_key()), Some(info));
    }

    #[test]
    fn test_same_tag_different_hash_are_distinct() {
        let cache = TagCache::in_memory();
        let mut first = tag("gcr.io/acme/app", "develop-100", 5);
        cache.put(&first).unwrap();
        first.hash = "rebuilt".to_string();
        cache.put(&first).unwrap();

        assert_eq!(cache.query_by_tag("develop-100").len(), 2);
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let cache = TagCache::in_memory();
        cache
            .put_with_ttl(&tag("gcr.io/acme/app", "develop-100", 5), Duration::ZERO)
            .unwrap();
        cache.put(&tag("gcr.io/acme/app", "develop-200", 1)).unwrap();

        let tags: Vec<String> = cache
            .query_by_image("gcr.io/acme/app")
            .into_iter()
            .map(|t| t.tag)
            .collect();
        assert_eq!(tags, vec!["develop-200"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_writes_evict_expired_records() {
        let cache = TagCache::in_memory();
        cache
            .put_with_ttl(&tag("gcr.io/acme/app", "develop-100", 5), Duration::ZERO)
            .unwrap();
        cache.put(&tag("gcr.io/acme/app", "develop-200", 1)).unwrap();

        let space = cache.space.read().unwrap();
        assert_eq!(space.records.len(), 1);
        assert_eq!(space.by_created.len(), 1);
        assert!(!space.by_tag.contains_key("develop-100"));
    }

    #[test]
    fn test_expired_records_are_not_counted() {
        let cache = TagCache::in_memory();
        cache
            .put_with_ttl(&tag("gcr.io/acme/app", "develop-100", 5), Duration::ZERO)
            .unwrap();

        // still held until the next write evicts it
        let space = cache.space.read().unwrap();
        assert_eq!(space.records.len(), 1);
        assert_eq!(space.live_count(Utc::now()), 0);
        drop(space);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_identical_created_orders_by_insertion() {
        let cache = TagCache::in_memory();
        let created = Utc::now() - ChronoDuration::minutes(1);
        let make = |name: &str| TagInfo {
            image: "gcr.io/acme/app".to_string(),
            hash: format!("sha-{}", name),
            created,
            tag: name.to_string(),
        };

        cache.put(&make("first")).unwrap();
        cache.put(&make("second")).unwrap();
        cache.put(&make("third")).unwrap();
        let tags = |cache: &TagCache| -> Vec<String> {
            cache
                .query_by_image("gcr.io/acme/app")
                .into_iter()
                .map(|t| t.tag)
                .collect()
        };
        assert_eq!(tags(&cache), vec!["third", "second", "first"]);

        // an upsert counts as the most recent write
        cache.put(&make("first")).unwrap();
        assert_eq!(tags(&cache), vec!["first", "third", "second"]);
    }

    #[test]
    fn test_concurrent_readers_see_newest_first() {
        let cache = TagCache::in_memory();
        let base = Utc::now() - ChronoDuration::hours(1);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for batch in 0..50i64 {
                    let infos: Vec<TagInfo> = (0..10i64)
                        .map(|i| {
                            let n = batch * 10 + i;
                            TagInfo {
                                image: "gcr.io/acme/app".to_string(),
                                hash: format!("sha-{}", n),
                                // batches interleave old and new push times
                                created: base + ChronoDuration::seconds((n * 7919) % 3600),
                                tag: format!("develop-{}", n),
                            }
                        })
                        .collect();
                    cache.put_many(&infos).unwrap();
                }
            });

            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let found = cache.query_by_image("gcr.io/acme/app");
                        assert_eq!(found.len() % 10, 0);
                        assert!(found.windows(2).all(|w| w[0].created >= w[1].created));
                    }
                });
            }
        });

        assert_eq!(cache.len(), 500);
    }

    #[test]
    fn test_undecodable_record_is_skipped() {
        let cache = TagCache::in_memory();
        let good = tag("gcr.io/acme/app", "develop-200", 1);
        let bad = tag("gcr.io/acme/app", "develop-100", 5);
        cache.put(&good).unwrap();
        cache.put(&bad).unwrap();

        cache
            .space
            .write()
            .unwrap()
            .records
            .get_mut(&bad.storage_key())
            .unwrap()
            .value = "{not json".to_string();

        assert_eq!(cache.query_by_image("gcr.io/acme/app"), vec![good]);
    }

    #[test]
    fn test_newest_spans_all_images() {
        let cache = TagCache::in_memory();
        cache.put(&tag("gcr.io/acme/a", "one", 10)).unwrap();
        cache.put(&tag("gcr.io/acme/b", "two", 1)).unwrap();

        let images: Vec<String> = cache.newest().into_iter().map(|t| t.image).collect();
        assert_eq!(images, vec!["gcr.io/acme/b", "gcr.io/acme/a"]);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let location = path.to_str().unwrap();

        let cache = TagCache::open(location).unwrap();
        cache.put(&tag("gcr.io/acme/app", "develop-100", 10)).unwrap();
        cache.put(&tag("gcr.io/acme/app", "develop-200", 1)).unwrap();
        cache.save().unwrap();

        let reopened = TagCache::open(location).unwrap();
        let tags: Vec<String> = reopened
            .query_by_image("gcr.io/acme/app")
            .into_iter()
            .map(|t| t.tag)
            .collect();
        assert_eq!(tags, vec!["develop-200", "develop-100"]);
    }

    #[test]
    fn test_snapshot_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        fs::write(&path, "garbage\n\n").unwrap();

        let cache = TagCache::open(path.to_str().unwrap()).unwrap();
        assert!(cache.is_empty());
    }
}
