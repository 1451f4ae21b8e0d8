//! In-memory key-value store.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chatbridge_core::{KeyValueStore, ScanPage, StoreError};

enum Entry {
    Plain(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
}

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Faults {
    offline: bool,
    fragments: Vec<String>,
}

/// In-memory store implementation.
///
/// Useful for development, tests and single-process deployments.
/// Data is lost on restart. Follows the same glob and TTL semantics as the
/// networked backend, and can simulate outages for failure-path tests.
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Slot>>,
    cursors: RwLock<HashMap<u64, String>>,
    next_cursor: AtomicU64,
    faults: RwLock<Faults>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            cursors: RwLock::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
            faults: RwLock::new(Faults::default()),
        }
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        if let Ok(mut faults) = self.faults.write() {
            faults.offline = !available;
        }
    }

    /// Make every operation touching a key that contains `fragment` fail.
    pub fn fail_keys_containing(&self, fragment: impl Into<String>) {
        if let Ok(mut faults) = self.faults.write() {
            faults.fragments.push(fragment.into());
        }
    }

    /// Remove every simulated fault.
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.write() {
            *faults = Faults::default();
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|s| s.live(now)).count())
            .unwrap_or(0)
    }

    /// Whether the store holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self, keys: &[&str]) -> Result<(), StoreError> {
        let faults = self
            .faults
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if faults.offline {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        if let Some(key) = keys
            .iter()
            .find(|k| faults.fragments.iter().any(|f| k.contains(f.as_str())))
        {
            return Err(StoreError::Unavailable(format!("simulated failure on {key}")));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Internal(format!("WRONGTYPE operation against key {key}"))
}

/// Glob match with `*`, `?` and `\` escapes.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                t += 1;
                continue;
            }
            Some('\\') if p + 1 < pattern.len() && pattern[p + 1] == text[t] => {
                p += 2;
                t += 1;
                continue;
            }
            Some(c) if *c != '\\' && *c == text[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, matched)) => {
                p = star + 1;
                t = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check(&[key])?;
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        match entries.get(key).filter(|s| s.live(Instant::now())) {
            None => Ok(None),
            Some(Slot {
                entry: Entry::Plain(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check(&[key])?;
        let slot = Slot {
            entry: Entry::Plain(value.to_vec()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(&[key])?;
        self.entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .remove(key);
        Ok(())
    }

    async fn hash_get(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError> {
        self.check(&[key])?;
        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let hash = match entries.get(key).filter(|s| s.live(Instant::now())) {
            None => None,
            Some(Slot {
                entry: Entry::Hash(hash),
                ..
            }) => Some(hash),
            Some(_) => return Err(wrong_type(key)),
        };

        Ok(fields
            .iter()
            .map(|f| (f.clone(), hash.and_then(|h| h.get(f).cloned())))
            .collect())
    }

    async fn hash_set_many(
        &self,
        key: &str,
        entries: &[(String, Vec<u8>)],
    ) -> Result<(), StoreError> {
        self.check(&[key])?;
        if entries.is_empty() {
            return Ok(());
        }
        let mut map = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let now = Instant::now();
        if map.get(key).is_some_and(|s| !s.live(now)) {
            map.remove(key);
        }
        let slot = map.entry(key.to_string()).or_insert_with(|| Slot {
            entry: Entry::Hash(HashMap::new()),
            expires_at: None,
        });
        let Entry::Hash(hash) = &mut slot.entry else {
            return Err(wrong_type(key));
        };
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        self.check(&[key])?;
        let mut map = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let emptied = match map.get_mut(key) {
            None => return Ok(()),
            Some(Slot {
                entry: Entry::Hash(hash),
                ..
            }) => {
                for field in fields {
                    hash.remove(field);
                }
                hash.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
        };
        // an emptied hash disappears, as on a networked backend
        if emptied {
            map.remove(key);
        }
        Ok(())
    }

    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        self.check(&[])?;
        let resume_after = if cursor == 0 {
            None
        } else {
            let key = self
                .cursors
                .write()
                .map_err(|e| StoreError::Internal(e.to_string()))?
                .remove(&cursor)
                .ok_or_else(|| StoreError::Internal(format!("unknown scan cursor {cursor}")))?;
            Some(key)
        };

        let entries = self
            .entries
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let lower = resume_after
            .as_ref()
            .map_or(Bound::Unbounded, |k| Bound::Excluded(k.clone()));

        let now = Instant::now();
        let mut examined = 0;
        let mut last = None;
        let mut keys = Vec::new();
        let mut range = entries.range((lower, Bound::Unbounded));
        for (key, slot) in range.by_ref() {
            examined += 1;
            last = Some(key.clone());
            if slot.live(now) && glob_match(pattern, key) {
                keys.push(key.clone());
            }
            if examined >= count.max(1) {
                break;
            }
        }

        let exhausted = range.next().is_none();
        let next = match last {
            Some(last) if !exhausted => {
                let id = self.next_cursor.fetch_add(1, Ordering::Relaxed);
                self.cursors
                    .write()
                    .map_err(|e| StoreError::Internal(e.to_string()))?
                    .insert(id, last);
                id
            }
            _ => 0,
        };

        Ok(ScanPage { cursor: next, keys })
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), StoreError> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.check(&refs)?;
        let mut map = self
            .entries
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        for key in keys {
            map.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a:*", "a:b:c"));
        assert!(glob_match("a:?", "a:b"));
        assert!(!glob_match("a:?", "a:bc"));
        assert!(glob_match("*:x", "a:b:x"));
        assert!(!glob_match("a:*", "b:a"));
        assert!(glob_match("p\\*:*", "p*:k"));
        assert!(!glob_match("p\\*:*", "pp:k"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn test_plain_and_hash() {
        let store = MemoryStore::new();
        assert_ok!(store.set("k", b"v", None).await);
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        let entries = vec![("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())];
        assert_ok!(store.hash_set_many("h", &entries).await);
        let got = store
            .hash_get("h", &["a".to_string(), "zz".to_string()])
            .await
            .unwrap();
        assert_eq!(got["a"], Some(b"1".to_vec()));
        assert_eq!(got["zz"], None);

        assert_err!(store.get("h").await);

        assert_ok!(store.hash_delete("h", &["a".to_string(), "b".to_string()]).await);
        assert!(store.hash_get("h", &["a".to_string()]).await.unwrap()["a"].is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("short", b"x", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(store.get("short").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("short").await.unwrap().is_none());
        assert!(store.scan("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_pages_drain_fully() {
        let store = MemoryStore::new();
        for n in 0..250 {
            store.set(&format!("s:keys:{n:03}"), b"x", None).await.unwrap();
            store.set(&format!("s:other:{n:03}"), b"x", None).await.unwrap();
        }

        let first = store.scan_page("s:keys:*", 0, 100).await.unwrap();
        assert_ne!(first.cursor, 0);
        assert!(first.keys.len() <= 100);

        let all = store.scan("s:keys:*").await.unwrap();
        assert_eq!(all.len(), 250);
        assert!(all.iter().all(|k| k.starts_with("s:keys:")));
    }

    #[tokio::test]
    async fn test_simulated_faults() {
        let store = MemoryStore::new();
        store.fail_keys_containing("bad");
        assert_err!(store.set("bad:key", b"x", None).await);
        assert_ok!(store.set("good:key", b"x", None).await);
        assert_err!(
            store
                .delete_batch(&["good:key".to_string(), "bad:key".to_string()])
                .await
        );
        // failed batch leaves everything in place
        assert!(store.get("good:key").await.unwrap().is_some());

        store.set_available(false);
        assert_err!(store.get("good:key").await);
        store.clear_faults();
        assert_ok!(store.get("good:key").await);
    }
}
