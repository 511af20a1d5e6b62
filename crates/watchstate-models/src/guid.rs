use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// External identity providers recognized across backends.
///
/// The alphabet is fixed: identifiers from any other provider are dropped at
/// the adapter layer with a warning rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuidSource {
    Imdb,
    Tvdb,
    Tmdb,
    Tvmaze,
    Tvrage,
    Anidb,
}

impl GuidSource {
    pub const ALL: [GuidSource; 6] = [
        GuidSource::Imdb,
        GuidSource::Tvdb,
        GuidSource::Tmdb,
        GuidSource::Tvmaze,
        GuidSource::Tvrage,
        GuidSource::Anidb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GuidSource::Imdb => "imdb",
            GuidSource::Tvdb => "tvdb",
            GuidSource::Tmdb => "tmdb",
            GuidSource::Tvmaze => "tvmaze",
            GuidSource::Tvrage => "tvrage",
            GuidSource::Anidb => "anidb",
        }
    }

    /// Check a raw identifier against the provider's expected shape.
    ///
    /// IMDb ids look like `tt1234567`; every other provider in the alphabet
    /// uses a plain numeric id.
    pub fn validate(&self, value: &str) -> bool {
        match self {
            GuidSource::Imdb => {
                value.len() > 2
                    && value.starts_with("tt")
                    && value[2..].chars().all(|c| c.is_ascii_digit())
            }
            _ => !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()),
        }
    }
}

impl fmt::Display for GuidSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuidSource {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "imdb" => Ok(GuidSource::Imdb),
            "tvdb" => Ok(GuidSource::Tvdb),
            "tmdb" => Ok(GuidSource::Tmdb),
            "tvmaze" => Ok(GuidSource::Tvmaze),
            "tvrage" => Ok(GuidSource::Tvrage),
            "anidb" => Ok(GuidSource::Anidb),
            _ => Err(()),
        }
    }
}

/// A single external identifier pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guid {
    pub source: GuidSource,
    pub value: String,
}

impl Guid {
    /// Pointer form, e.g. `imdb://tt1160419`.
    pub fn pointer(&self) -> String {
        format!("{}://{}", self.source, self.value)
    }
}

/// Set of external identifiers keyed by provider.
///
/// Two states with any overlapping pair are the same entity, so this map is
/// the identity of a record. Insertion validates against the provider
/// alphabet; unknown or malformed ids never make it in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuidMap(BTreeMap<GuidSource, String>);

impl GuidMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated identifier. Returns false (and warns) when the
    /// value does not match the provider's shape.
    pub fn insert(&mut self, source: GuidSource, value: impl Into<String>) -> bool {
        let value = value.into();
        if !source.validate(&value) {
            warn!(source = %source, value = %value, "discarding malformed external id");
            return false;
        }
        self.0.insert(source, value);
        true
    }

    /// Parse and insert a `source://value` or `(source, value)` pair where the
    /// source tag is a free-form string. Unknown tags are dropped with a
    /// warning, matching the fixed alphabet rule.
    pub fn insert_tagged(&mut self, tag: &str, value: &str) -> bool {
        match tag.parse::<GuidSource>() {
            Ok(source) => self.insert(source, value),
            Err(()) => {
                warn!(source = %tag, value = %value, "discarding id from unknown provider");
                false
            }
        }
    }

    pub fn get(&self, source: GuidSource) -> Option<&str> {
        self.0.get(&source).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Guid> + '_ {
        self.0.iter().map(|(source, value)| Guid {
            source: *source,
            value: value.clone(),
        })
    }

    /// Pointer strings for every pair, e.g. `["imdb://tt1160419"]`.
    pub fn pointers(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(source, value)| format!("{}://{}", source, value))
            .collect()
    }

    /// True when the two maps share at least one identical pair.
    pub fn overlaps(&self, other: &GuidMap) -> bool {
        self.0
            .iter()
            .any(|(source, value)| other.0.get(source) == Some(value))
    }

    /// Union with `other`. On a conflicting pair for the same provider the
    /// caller decides the winner via `incoming_wins`; the loser is logged.
    pub fn union_from(&mut self, other: &GuidMap, incoming_wins: bool) {
        for (source, value) in &other.0 {
            match self.0.get(source) {
                None => {
                    self.0.insert(*source, value.clone());
                }
                Some(existing) if existing != value => {
                    warn!(
                        source = %source,
                        existing = %existing,
                        incoming = %value,
                        "conflicting external id for the same provider"
                    );
                    if incoming_wins {
                        self.0.insert(*source, value.clone());
                    }
                }
                Some(_) => {}
            }
        }
    }
}

/// Build the virtual pointer contributed by a backend for a remote item,
/// `backend://<name>:<remote_id>`. Backend names are `[a-z0-9_]+`; the remote
/// id is opaque.
pub fn virtual_pointer(backend: &str, remote_id: &str) -> String {
    format!("backend://{}:{}", backend, remote_id)
}

/// True when `name` fits the virtual-GUID backend-name grammar.
pub fn valid_backend_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
