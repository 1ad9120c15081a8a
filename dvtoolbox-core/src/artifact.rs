//! Artifacts: identity rules, records and ordered identity-keyed sets.
//!
//! Every artifact kind chooses an [`IdentityRule`] that turns a raw name into
//! the comparison key. Sets are parameterised by that rule, so a local and a
//! remote view can only be reconciled when they agree on it.

use std::fmt;
use std::marker::PhantomData;

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

/// Normalises a raw artifact name into its comparison key.
pub trait IdentityRule: Send + Sync + 'static {
    fn normalize(raw: &str) -> String;
}

/// Path-like identities: forward slashes, no leading slash, case-insensitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathIdentity;

impl IdentityRule for PathIdentity {
    fn normalize(raw: &str) -> String {
        raw.replace('\\', "/").trim_start_matches('/').to_lowercase()
    }
}

/// Logical names and ids, compared exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactIdentity;

impl IdentityRule for ExactIdentity {
    fn normalize(raw: &str) -> String {
        raw.to_string()
    }
}

/// Joins the parts of a composite identity (e.g. extension point + step).
pub fn composite_name(parts: &[&str]) -> String {
    parts.join("/")
}

/// The natural key of one artifact plus the name it was declared under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactIdentity {
    pub key: String,
    pub name: String,
}

impl fmt::Display for ArtifactIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Text(String),
}

impl Payload {
    fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            Payload::Empty => {}
            Payload::Text(text) => hasher.update(text.as_bytes()),
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// One artifact instance: name, payload, change fingerprint and, for remote
/// views, the id of the backing record.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub name: String,
    pub payload: Payload,
    pub fingerprint: String,
    pub remote_id: Option<Uuid>,
}

impl ArtifactRecord {
    /// Fingerprint is the SHA-256 of the payload.
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        let fingerprint = payload.fingerprint();
        Self {
            name: name.into(),
            payload,
            fingerprint,
            remote_id: None,
        }
    }

    /// An identity-only record; two of these never count as changed.
    pub fn marker(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Payload::Empty,
            fingerprint: String::new(),
            remote_id: None,
        }
    }

    pub fn with_remote_id(mut self, id: Uuid) -> Self {
        self.remote_id = Some(id);
        self
    }
}

/// Identity-keyed artifacts in production order.
#[derive(Debug, Clone)]
pub struct ArtifactSet<R: IdentityRule> {
    entries: IndexMap<String, ArtifactRecord>,
    rule: PhantomData<R>,
}

impl<R: IdentityRule> Default for ArtifactSet<R> {
    fn default() -> Self {
        Self {
            entries: IndexMap::new(),
            rule: PhantomData,
        }
    }
}

impl<R: IdentityRule> ArtifactSet<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record. A second record with the same identity replaces the
    /// first one but keeps its position.
    pub fn insert(&mut self, record: ArtifactRecord) {
        let key = R::normalize(&record.name);
        if let Some(previous) = self.entries.insert(key.clone(), record) {
            warn!(
                identity = %key,
                previous = %previous.name,
                "Duplicate artifact identity, keeping the latest record"
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<&ArtifactRecord> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with their keys, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArtifactRecord)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

impl<R: IdentityRule> FromIterator<ArtifactRecord> for ArtifactSet<R> {
    fn from_iter<I: IntoIterator<Item = ArtifactRecord>>(iter: I) -> Self {
        let mut set = Self::new();
        for record in iter {
            set.insert(record);
        }
        set
    }
}
