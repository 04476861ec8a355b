//! Core type definitions for the mastermind client
//!
//! This module defines the remote addressing types, the catalog of cached
//! datasets and the immutable values each dataset holds.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ---- Remote addressing ----

/// Address family of a remote endpoint (values match `AF_INET`/`AF_INET6`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum AddressFamily {
    #[display("2")]
    Inet,
    #[display("10")]
    Inet6,
}

impl FromStr for AddressFamily {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "2" | "inet" | "ipv4" => Ok(Self::Inet),
            "10" | "inet6" | "ipv6" => Ok(Self::Inet6),
            other => Err(EndpointParseError::InvalidFamily(other.to_string())),
        }
    }
}

/// One instance of the remote metadata service
///
/// Textual form is `host:port` or `host:port:family`; IPv6 hosts are
/// written in brackets (`[::1]:10053:10`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
}

impl RemoteEndpoint {
    /// Create an endpoint, inferring the family from the host literal
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let family = if host.contains(':') {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        Self { host, port, family }
    }

    /// Create an endpoint with an explicit family
    #[must_use]
    pub fn with_family(host: impl Into<String>, port: u16, family: AddressFamily) -> Self {
        Self {
            host: host.into(),
            port,
            family,
        }
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}:{}", self.host, self.port, self.family)
        } else {
            write!(f, "{}:{}:{}", self.host, self.port, self.family)
        }
    }
}

impl FromStr for RemoteEndpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointParseError::Empty);
        }

        let (host, port, family) = if let Some(bracketed) = s.strip_prefix('[') {
            let (host, rest) = bracketed
                .split_once(']')
                .ok_or_else(|| EndpointParseError::Malformed(s.to_string()))?;
            let rest = rest
                .strip_prefix(':')
                .ok_or_else(|| EndpointParseError::Malformed(s.to_string()))?;
            match rest.split_once(':') {
                Some((port, family)) => (host, port, Some(family)),
                None => (host, rest, None),
            }
        } else {
            let (head, last) = s
                .rsplit_once(':')
                .ok_or_else(|| EndpointParseError::Malformed(s.to_string()))?;
            match head.rsplit_once(':') {
                Some((host, port)) => (host, port, Some(last)),
                None => (head, last, None),
            }
        };

        if host.is_empty() {
            return Err(EndpointParseError::Malformed(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(port.to_string()))?;

        Ok(match family {
            Some(family) => Self::with_family(host, port, family.parse()?),
            None => Self::new(host, port),
        })
    }
}

/// Errors that can occur when parsing a remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
    #[error("endpoint is empty")]
    Empty,
    #[error("malformed endpoint '{0}', expected host:port[:family]")]
    Malformed(String),
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("invalid address family '{0}'")]
    InvalidFamily(String),
}

// ---- Dataset catalog ----

/// The fixed catalog of datasets mirrored from the remote service
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
pub enum DatasetKind {
    #[display("namespace-states")]
    NamespaceStates,
    #[display("cached-keys")]
    CachedKeys,
    #[display("elliptics-remotes")]
    EllipticsRemotes,
    #[display("namespace-settings")]
    NamespaceSettings,
    #[display("bad-groups")]
    BadGroups,
    #[display("fake-groups-info")]
    FakeGroupsInfo,
}

impl DatasetKind {
    /// All datasets in refresh order: remote addressing first, then the
    /// datasets that reference it.
    pub const ALL: [Self; 6] = [
        Self::EllipticsRemotes,
        Self::NamespaceSettings,
        Self::NamespaceStates,
        Self::CachedKeys,
        Self::BadGroups,
        Self::FakeGroupsInfo,
    ];

    /// Stable dataset name (used in config and in the snapshot file)
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NamespaceStates => "namespace-states",
            Self::CachedKeys => "cached-keys",
            Self::EllipticsRemotes => "elliptics-remotes",
            Self::NamespaceSettings => "namespace-settings",
            Self::BadGroups => "bad-groups",
            Self::FakeGroupsInfo => "fake-groups-info",
        }
    }

    /// Remote event that fetches this dataset
    #[must_use]
    pub const fn event(self) -> &'static str {
        match self {
            Self::NamespaceStates => "fetch-namespace-states",
            Self::CachedKeys => "fetch-cached-keys",
            Self::EllipticsRemotes => "fetch-elliptics-remotes",
            Self::NamespaceSettings => "fetch-namespace-settings",
            Self::BadGroups => "fetch-bad-groups",
            Self::FakeGroupsInfo => "fetch-fake-groups-info",
        }
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("unknown dataset '{s}'"))
    }
}

// ---- Namespace settings ----

/// Raw fields of a namespace's settings
///
/// Fill this in once and convert it into an immutable `NamespaceSettings`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceSettingsData {
    pub name: String,
    pub groups_count: u32,
    pub success_copies_num: String,
    pub auth_key: String,
    pub auth_key_for_write: String,
    pub auth_key_for_read: String,
    pub static_couple: Vec<u32>,
    pub sign_token: String,
    pub sign_path_prefix: String,
    pub sign_port: String,
    pub redirect_expire_time: u32,
    pub redirect_content_length_threshold: i64,
    pub is_active: bool,
    pub can_choose_couple_to_upload: bool,
    pub multipart_content_length_threshold: i64,
    /// Caller-defined fields attached by a settings extension
    pub extensions: BTreeMap<String, Value>,
}

impl Default for NamespaceSettingsData {
    fn default() -> Self {
        Self {
            name: String::new(),
            groups_count: 0,
            success_copies_num: String::new(),
            auth_key: String::new(),
            auth_key_for_write: String::new(),
            auth_key_for_read: String::new(),
            static_couple: Vec::new(),
            sign_token: String::new(),
            sign_path_prefix: String::new(),
            sign_port: String::new(),
            redirect_expire_time: 0,
            redirect_content_length_threshold: -1,
            is_active: false,
            can_choose_couple_to_upload: false,
            multipart_content_length_threshold: 0,
            extensions: BTreeMap::new(),
        }
    }
}

/// Immutable settings of one namespace
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceSettings {
    data: NamespaceSettingsData,
}

impl From<NamespaceSettingsData> for NamespaceSettings {
    fn from(data: NamespaceSettingsData) -> Self {
        Self { data }
    }
}

impl NamespaceSettings {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.data.name
    }

    #[must_use]
    pub fn groups_count(&self) -> u32 {
        self.data.groups_count
    }

    #[must_use]
    pub fn success_copies_num(&self) -> &str {
        &self.data.success_copies_num
    }

    /// Plain auth key, falling back to the write key when unset
    #[must_use]
    pub fn auth_key(&self) -> &str {
        if self.data.auth_key.is_empty() {
            &self.data.auth_key_for_write
        } else {
            &self.data.auth_key
        }
    }

    /// Write auth key, falling back to the plain key when unset
    #[must_use]
    pub fn auth_key_for_write(&self) -> &str {
        if self.data.auth_key_for_write.is_empty() {
            &self.data.auth_key
        } else {
            &self.data.auth_key_for_write
        }
    }

    #[must_use]
    pub fn auth_key_for_read(&self) -> &str {
        &self.data.auth_key_for_read
    }

    #[must_use]
    pub fn static_couple(&self) -> &[u32] {
        &self.data.static_couple
    }

    #[must_use]
    pub fn sign_token(&self) -> &str {
        &self.data.sign_token
    }

    #[must_use]
    pub fn sign_path_prefix(&self) -> &str {
        &self.data.sign_path_prefix
    }

    #[must_use]
    pub fn sign_port(&self) -> &str {
        &self.data.sign_port
    }

    #[must_use]
    pub fn redirect_expire_time(&self) -> u32 {
        self.data.redirect_expire_time
    }

    /// Content length above which reads are redirected (-1 disables)
    #[must_use]
    pub fn redirect_content_length_threshold(&self) -> i64 {
        self.data.redirect_content_length_threshold
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.data.is_active
    }

    #[must_use]
    pub fn can_choose_couple_to_upload(&self) -> bool {
        self.data.can_choose_couple_to_upload
    }

    #[must_use]
    pub fn multipart_content_length_threshold(&self) -> i64 {
        self.data.multipart_content_length_threshold
    }

    /// Get a field attached by the settings extension
    #[must_use]
    pub fn extension(&self, key: &str) -> Option<&Value> {
        self.data.extensions.get(key)
    }

    #[must_use]
    pub fn extensions(&self) -> &BTreeMap<String, Value> {
        &self.data.extensions
    }
}

/// Settings of every namespace, in the order the remote listed them
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceSettingsList(pub Vec<NamespaceSettings>);

impl NamespaceSettingsList {
    /// Find a namespace by name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&NamespaceSettings> {
        self.0.iter().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamespaceSettings> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---- Namespace states ----

/// Couple status as reported by the remote
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoupleStatus {
    #[display("OK")]
    Ok,
    #[display("FULL")]
    Full,
    #[display("FROZEN")]
    Frozen,
    #[display("BAD")]
    Bad,
    #[display("BROKEN")]
    Broken,
    #[display("UNKNOWN")]
    #[serde(other)]
    Unknown,
}

/// One couple (replica set of groups) in a namespace
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoupleState {
    /// Couple identifier, e.g. "1:2:3"
    pub id: String,
    pub groups: Vec<u32>,
    pub status: CoupleStatus,
    /// Upload weight computed by the remote
    pub weight: u64,
    pub free_space: u64,
}

impl CoupleState {
    /// Check if new data may be written to this couple
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.status == CoupleStatus::Ok && self.weight > 0
    }
}

/// Namespace-wide statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStatistics {
    pub is_full: bool,
}

/// Full state of one namespace: settings, couples and statistics
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceState {
    pub settings: NamespaceSettings,
    pub couples: Vec<CoupleState>,
    pub statistics: NamespaceStatistics,
}

impl NamespaceState {
    #[must_use]
    pub fn name(&self) -> &str {
        self.settings.name()
    }

    /// Couples that accept uploads, heaviest first
    #[must_use]
    pub fn writable_couples(&self) -> Vec<&CoupleState> {
        let mut couples: Vec<_> = self.couples.iter().filter(|c| c.is_writable()).collect();
        couples.sort_by(|a, b| b.weight.cmp(&a.weight));
        couples
    }

    /// Find the couple a group belongs to
    #[must_use]
    pub fn couple_for_group(&self, group: u32) -> Option<&CoupleState> {
        self.couples.iter().find(|c| c.groups.contains(&group))
    }
}

/// States of all namespaces keyed by namespace name
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceStates(pub BTreeMap<String, NamespaceState>);

impl NamespaceStates {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NamespaceState> {
        self.0.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---- Cached keys ----

/// Cache group placement: key -> couple id -> cache groups
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CachedKeys(pub BTreeMap<String, BTreeMap<u32, Vec<u32>>>);

impl CachedKeys {
    /// Cache groups holding `key` stored in `couple_id`
    #[must_use]
    pub fn groups(&self, key: &str, couple_id: u32) -> Option<&[u32]> {
        self.0
            .get(key)
            .and_then(|couples| couples.get(&couple_id))
            .map(Vec::as_slice)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---- Elliptics remotes ----

/// Storage node addresses published by the remote
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EllipticsRemotes(pub Vec<RemoteEndpoint>);

impl EllipticsRemotes {
    pub fn iter(&self) -> impl Iterator<Item = &RemoteEndpoint> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---- Bad groups ----

/// Couples whose groups are in a bad state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BadGroups(pub Vec<Vec<u32>>);

impl BadGroups {
    /// Check if a group is listed in any bad couple
    #[must_use]
    pub fn contains_group(&self, group: u32) -> bool {
        self.0.iter().any(|couple| couple.contains(&group))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---- Fake groups ----

/// A group that exists in the cluster without backing a couple
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeGroupInfo {
    pub id: u32,
    pub group_type: String,
    pub status: String,
}

/// Fake groups keyed by group id
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FakeGroupsInfo(pub BTreeMap<u32, FakeGroupInfo>);

impl FakeGroupsInfo {
    #[must_use]
    pub fn get(&self, group: u32) -> Option<&FakeGroupInfo> {
        self.0.get(&group)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---- Direct calls ----

/// Couple description returned by a direct `fetch-couple-info` call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoupleInfo {
    pub id: String,
    pub namespace: String,
    pub groups: Vec<u32>,
    pub status: CoupleStatus,
}
