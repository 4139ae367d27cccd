use std::borrow::Cow;
use std::collections::BTreeMap;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Prefix that keeps anonymous keys apart from user subjects.
pub const ANON_KEY_PREFIX: &str = "anon:";

/// Returns the store key for an anonymous session id.
pub fn anon_key(anon_id: &str) -> String {
    format!("{}{}", ANON_KEY_PREFIX, anon_id)
}

/// One generated caption, as kept in an identity's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub caption: String,
    /// Seconds since the Unix epoch, with sub-second precision. Older files
    /// may lack it, in which case it reads as `0`.
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl UsageRecord {
    /// Creates a record stamped with the current time.
    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            timestamp: now_timestamp(),
            image_url: None,
            image_path: None,
            model: None,
        }
    }

    pub fn with_image_url(mut self, image_url: Option<String>) -> Self {
        self.image_url = image_url;
        self
    }

    pub fn with_image_path(mut self, image_path: Option<String>) -> Self {
        self.image_path = image_path;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// Current wall-clock time as fractional Unix seconds.
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// The state kept for an anonymous session.
///
/// `count` is the number of free usages consumed and is independent of
/// `items.len()`, which is capped like any other history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnonRecord {
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub items: Vec<UsageRecord>,
}

/// A value in the history database: a user's list or an anonymous record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryEntry {
    User(Vec<UsageRecord>),
    Anonymous(AnonRecord),
}

/// Prepends `records` (already newest-first) onto `history` and drops what exceeds `cap`.
pub fn prepend_capped(history: &mut Vec<UsageRecord>, records: Vec<UsageRecord>, cap: usize) {
    history.splice(0..0, records);
    history.truncate(cap);
}

/// The whole history database held in memory between a load and a save.
///
/// Values read from disk are kept as raw JSON until their key is written,
/// so entries this service cannot decode (or fields it does not know) survive
/// a rewrite untouched.
#[derive(Debug, Clone)]
pub struct HistoryBook {
    entries: BTreeMap<String, HistoryEntry>,
    preserved: BTreeMap<String, String>,
    cap: usize,
    writable: bool,
}

impl HistoryBook {
    pub fn new(entries: BTreeMap<String, HistoryEntry>, cap: usize) -> Self {
        Self {
            entries,
            preserved: BTreeMap::new(),
            cap,
            writable: true,
        }
    }

    pub fn empty(cap: usize) -> Self {
        Self::new(BTreeMap::new(), cap)
    }

    /// An empty book standing in for a database that exists but could not be
    /// read. It must never be saved over the original.
    pub fn detached(cap: usize) -> Self {
        Self {
            writable: false,
            ..Self::empty(cap)
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Builds a book from the raw JSON value stored under each key.
    ///
    /// Keys whose value does not decode are kept verbatim and read as empty.
    pub fn from_raw<'a>(raw: impl IntoIterator<Item = (String, &'a str)>, cap: usize) -> Self {
        let mut book = Self::empty(cap);

        for (key, value) in raw {
            match sonic_rs::from_str::<HistoryEntry>(value) {
                Ok(entry) => {
                    book.entries.insert(key.clone(), entry);
                }
                Err(e) => {
                    tracing::warn!("Keeping undecodable history entry '{}' as-is: {}", key, e);
                }
            }
            book.preserved.insert(key, value.to_string());
        }

        book
    }

    /// Serializes the book as one JSON object. Untouched keys are written back verbatim.
    pub fn to_json(&self) -> sonic_rs::Result<Vec<u8>> {
        let mut values: BTreeMap<&str, Cow<'_, str>> = self
            .preserved
            .iter()
            .map(|(key, raw)| (key.as_str(), Cow::Borrowed(raw.as_str())))
            .collect();

        for (key, entry) in &self.entries {
            if !self.preserved.contains_key(key) {
                values.insert(key.as_str(), Cow::Owned(sonic_rs::to_string(entry)?));
            }
        }

        let mut out = Vec::with_capacity(values.values().map(|v| v.len() + 16).sum::<usize>() + 2);
        out.push(b'{');
        for (i, (key, value)) in values.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(sonic_rs::to_string(key)?.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
        }
        out.push(b'}');

        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.preserved
            .keys()
            .filter(|key| !self.entries.contains_key(*key))
            .count()
            + self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key) || self.preserved.contains_key(key)
    }

    /// A user's history; empty when the key is unknown or holds an anonymous record.
    pub fn get_history(&self, key: &str) -> Vec<UsageRecord> {
        match self.entries.get(key) {
            Some(HistoryEntry::User(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Replaces a user's history, keeping the `cap` newest entries.
    pub fn put_history(&mut self, key: &str, mut items: Vec<UsageRecord>) {
        items.truncate(self.cap);
        self.preserved.remove(key);
        self.entries.insert(key.to_string(), HistoryEntry::User(items));
    }

    /// The anonymous record at `key`, if one was ever written.
    pub fn find_anon_record(&self, key: &str) -> Option<AnonRecord> {
        match self.entries.get(key) {
            Some(HistoryEntry::Anonymous(record)) => Some(record.clone()),
            _ => None,
        }
    }

    /// The anonymous record at `key`, or a fresh `{count: 0, items: []}`.
    pub fn get_anon_record(&self, key: &str) -> AnonRecord {
        self.find_anon_record(key).unwrap_or_default()
    }

    pub fn put_anon_record(&mut self, key: &str, mut record: AnonRecord) {
        record.items.truncate(self.cap);
        self.preserved.remove(key);
        self.entries
            .insert(key.to_string(), HistoryEntry::Anonymous(record));
    }

    /// Removes `key`. Absent keys are ignored.
    pub fn delete(&mut self, key: &str) {
        self.entries.remove(key);
        self.preserved.remove(key);
    }
}
