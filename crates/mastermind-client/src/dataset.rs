//! Decoding of raw remote responses into dataset values
//!
//! Every dataset kind maps one structured response to its value type. The
//! remote emits kebab-case documents; they are read into private wire
//! structs and then converted, so the value types keep their own field
//! names (which is also the shape written to the snapshot file).

use mastermind_common::{
    BadGroups, CachedKeys, CoupleState, CoupleStatus, DatasetKind, EllipticsRemotes, Error,
    FakeGroupInfo, FakeGroupsInfo, NamespaceSettings, NamespaceSettingsData,
    NamespaceSettingsList, NamespaceState, NamespaceStates, NamespaceStatistics, RemoteEndpoint,
    Result,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Caller hook attaching derived fields to each decoded namespace
///
/// Called once per namespace with its name and raw settings document. An
/// error fails the whole dataset for that cycle.
pub trait SettingsExtension: Send + Sync {
    fn extend(
        &self,
        namespace: &str,
        raw: &Value,
    ) -> std::result::Result<BTreeMap<String, Value>, String>;
}

impl<F> SettingsExtension for F
where
    F: Fn(&str, &Value) -> std::result::Result<BTreeMap<String, Value>, String> + Send + Sync,
{
    fn extend(
        &self,
        namespace: &str,
        raw: &Value,
    ) -> std::result::Result<BTreeMap<String, Value>, String> {
        self(namespace, raw)
    }
}

/// State shared by all decoders of one controller
#[derive(Clone, Default)]
pub struct DecodeContext {
    extension: Option<Arc<dyn SettingsExtension>>,
}

impl DecodeContext {
    pub fn new(extension: Option<Arc<dyn SettingsExtension>>) -> Self {
        Self { extension }
    }
}

/// A value type fetched from the remote as one dataset
pub trait Dataset: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: DatasetKind;

    /// Map a raw response to the value, failing on any unexpected shape
    fn decode(raw: Value, ctx: &DecodeContext) -> Result<Self>;
}

fn from_wire<W: DeserializeOwned>(kind: DatasetKind, raw: Value) -> Result<W> {
    serde_json::from_value(raw).map_err(|e| Error::decode(kind, e))
}

// ---- Namespace settings ----

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct AuthKeysWire {
    write: String,
    read: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SignatureWire {
    token: String,
    path_prefix: String,
    port: String,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct RedirectWire {
    expire_time: u32,
    content_length_threshold: i64,
}

impl Default for RedirectWire {
    fn default() -> Self {
        Self {
            expire_time: 0,
            content_length_threshold: -1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct MultipartWire {
    content_length_threshold: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct FeaturesWire {
    select_couple_to_upload: bool,
    multipart: MultipartWire,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct SettingsWire {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    groups_count: u32,
    #[serde(default, deserialize_with = "copies_num")]
    success_copies_num: String,
    #[serde(default)]
    auth_key: String,
    #[serde(default)]
    auth_keys: AuthKeysWire,
    #[serde(default)]
    static_couple: Vec<u32>,
    #[serde(default)]
    signature: SignatureWire,
    #[serde(default)]
    redirect: RedirectWire,
    #[serde(default, rename = "is_active")]
    is_active: bool,
    #[serde(default)]
    features: FeaturesWire,
}

/// `success-copies-num` is a policy name ("any", "quorum", "all") but some
/// remotes send a plain number
fn copies_num<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "success-copies-num must be a string, got {other}"
        ))),
    }
}

fn decode_settings(
    kind: DatasetKind,
    name: Option<&str>,
    raw: Value,
    ctx: &DecodeContext,
) -> Result<NamespaceSettings> {
    let extensions = match &ctx.extension {
        Some(ext) => {
            let owner = name
                .map(str::to_string)
                .or_else(|| raw.get("namespace").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            ext.extend(&owner, &raw)
                .map_err(|e| Error::decode(kind, format!("namespace '{owner}': {e}")))?
        }
        None => BTreeMap::new(),
    };

    let wire: SettingsWire = from_wire(kind, raw)?;
    let name = match (name, wire.namespace) {
        (Some(name), _) => name.to_string(),
        (None, Some(name)) if !name.is_empty() => name,
        (None, _) => return Err(Error::decode(kind, "namespace settings without a name")),
    };

    Ok(NamespaceSettingsData {
        name,
        groups_count: wire.groups_count,
        success_copies_num: wire.success_copies_num,
        auth_key: wire.auth_key,
        auth_key_for_write: wire.auth_keys.write,
        auth_key_for_read: wire.auth_keys.read,
        static_couple: wire.static_couple,
        sign_token: wire.signature.token,
        sign_path_prefix: wire.signature.path_prefix,
        sign_port: wire.signature.port,
        redirect_expire_time: wire.redirect.expire_time,
        redirect_content_length_threshold: wire.redirect.content_length_threshold,
        is_active: wire.is_active,
        can_choose_couple_to_upload: wire.features.select_couple_to_upload,
        multipart_content_length_threshold: wire.features.multipart.content_length_threshold,
        extensions,
    }
    .into())
}

impl Dataset for NamespaceSettingsList {
    const KIND: DatasetKind = DatasetKind::NamespaceSettings;

    fn decode(raw: Value, ctx: &DecodeContext) -> Result<Self> {
        let items: Vec<Value> = from_wire(Self::KIND, raw)?;
        let settings = items
            .into_iter()
            .map(|item| decode_settings(Self::KIND, None, item, ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(settings))
    }
}

// ---- Namespace states ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CoupleWire {
    id: String,
    groups: Vec<u32>,
    status: CoupleStatus,
    #[serde(default)]
    weight: u64,
    #[serde(default)]
    free_space: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatisticsWire {
    is_full: bool,
}

#[derive(Debug, Deserialize)]
struct StateWire {
    #[serde(default)]
    settings: Value,
    #[serde(default)]
    couples: Vec<CoupleWire>,
    #[serde(default)]
    statistics: StatisticsWire,
}

impl Dataset for NamespaceStates {
    const KIND: DatasetKind = DatasetKind::NamespaceStates;

    fn decode(raw: Value, ctx: &DecodeContext) -> Result<Self> {
        let states: BTreeMap<String, StateWire> = from_wire(Self::KIND, raw)?;
        let mut out = BTreeMap::new();
        for (name, state) in states {
            let settings = match state.settings {
                Value::Null => Value::Object(Default::default()),
                other => other,
            };
            let settings = decode_settings(Self::KIND, Some(&name), settings, ctx)?;
            let couples = state
                .couples
                .into_iter()
                .map(|c| CoupleState {
                    id: c.id,
                    groups: c.groups,
                    status: c.status,
                    weight: c.weight,
                    free_space: c.free_space,
                })
                .collect();
            out.insert(
                name,
                NamespaceState {
                    settings,
                    couples,
                    statistics: NamespaceStatistics {
                        is_full: state.statistics.is_full,
                    },
                },
            );
        }
        Ok(Self(out))
    }
}

// ---- Cached keys ----

impl Dataset for CachedKeys {
    const KIND: DatasetKind = DatasetKind::CachedKeys;

    fn decode(raw: Value, _ctx: &DecodeContext) -> Result<Self> {
        let keys: BTreeMap<String, BTreeMap<String, Vec<u32>>> = from_wire(Self::KIND, raw)?;
        let mut out = BTreeMap::new();
        for (key, couples) in keys {
            let mut by_couple = BTreeMap::new();
            for (couple, groups) in couples {
                let couple_id: u32 = couple.parse().map_err(|_| {
                    Error::decode(Self::KIND, format!("key '{key}': bad couple id '{couple}'"))
                })?;
                by_couple.insert(couple_id, groups);
            }
            out.insert(key, by_couple);
        }
        Ok(Self(out))
    }
}

// ---- Elliptics remotes ----

impl Dataset for EllipticsRemotes {
    const KIND: DatasetKind = DatasetKind::EllipticsRemotes;

    fn decode(raw: Value, _ctx: &DecodeContext) -> Result<Self> {
        let remotes: Vec<String> = from_wire(Self::KIND, raw)?;
        let remotes = remotes
            .iter()
            .map(|r| {
                r.parse::<RemoteEndpoint>()
                    .map_err(|e| Error::decode(Self::KIND, format!("'{r}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(remotes))
    }
}

// ---- Bad groups ----

impl Dataset for BadGroups {
    const KIND: DatasetKind = DatasetKind::BadGroups;

    fn decode(raw: Value, _ctx: &DecodeContext) -> Result<Self> {
        Ok(Self(from_wire(Self::KIND, raw)?))
    }
}

// ---- Fake groups ----

#[derive(Debug, Deserialize)]
struct FakeGroupWire {
    #[serde(rename = "type")]
    group_type: String,
    #[serde(default)]
    status: String,
}

impl Dataset for FakeGroupsInfo {
    const KIND: DatasetKind = DatasetKind::FakeGroupsInfo;

    fn decode(raw: Value, _ctx: &DecodeContext) -> Result<Self> {
        let groups: BTreeMap<String, FakeGroupWire> = from_wire(Self::KIND, raw)?;
        let mut out = BTreeMap::new();
        for (id, group) in groups {
            let id: u32 = id
                .parse()
                .map_err(|_| Error::decode(Self::KIND, format!("bad group id '{id}'")))?;
            out.insert(
                id,
                FakeGroupInfo {
                    id,
                    group_type: group.group_type,
                    status: group.status,
                },
            );
        }
        Ok(Self(out))
    }
}
