// ── Line domain types ──

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::{BindingInfo, EndpointId, LineId};
use super::saga::{ReprovisioningRecord, SagaPhase};
use crate::error::CoreError;

/// Preferred radio access technology for a line.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum NetworkPreference {
    #[default]
    #[strum(serialize = "auto")]
    #[serde(rename = "auto")]
    Auto,
    #[strum(serialize = "lte", serialize = "4g")]
    #[serde(rename = "lte")]
    Lte,
    #[strum(serialize = "5g")]
    #[serde(rename = "5g")]
    FiveG,
    #[strum(serialize = "3g")]
    #[serde(rename = "3g")]
    ThreeG,
}

/// Attributes a caller can change on a line, one mutation at a time.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum Attribute {
    Suspended,
    ImeiLocked,
    NetworkPreference,
    Package,
}

/// Last known provider-side attribute values of a line.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LineAttributes {
    pub suspended: bool,
    pub imei_locked: bool,
    pub network_preference: NetworkPreference,
    pub package_id: u32,
    pub data_usage_gb: f64,
    pub max_data_gb: f64,
    pub status: String,
}

impl LineAttributes {
    /// The current value of `attribute`, expressed as the mutation that
    /// would set it. Used to capture rollback targets.
    pub fn current(&self, attribute: Attribute) -> Mutation {
        match attribute {
            Attribute::Suspended => Mutation::Suspend(self.suspended),
            Attribute::ImeiLocked => Mutation::ImeiLock(self.imei_locked),
            Attribute::NetworkPreference => Mutation::NetworkPreference(self.network_preference),
            Attribute::Package => Mutation::Package(self.package_id),
        }
    }

    /// Provider status is reported as either `active` or `Active`.
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "Active")
    }

    pub(crate) fn apply(&mut self, mutation: &Mutation) {
        match *mutation {
            Mutation::Suspend(v) => self.suspended = v,
            Mutation::ImeiLock(v) => self.imei_locked = v,
            Mutation::NetworkPreference(v) => self.network_preference = v,
            Mutation::Package(v) => self.package_id = v,
        }
    }

    /// Copy fetched values into `self`, skipping mutable attributes for
    /// which `hold` returns `true`. Read-only values are always copied.
    /// Returns the mutable attributes that were written.
    pub(crate) fn merge_from(
        &mut self,
        fetched: &Self,
        hold: impl Fn(Attribute) -> bool,
    ) -> Vec<Attribute> {
        let mut merged = Vec::new();
        for attribute in <Attribute as strum::IntoEnumIterator>::iter() {
            if hold(attribute) {
                continue;
            }
            self.apply(&fetched.current(attribute));
            merged.push(attribute);
        }
        self.data_usage_gb = fetched.data_usage_gb;
        self.max_data_gb = fetched.max_data_gb;
        self.status.clone_from(&fetched.status);
        merged
    }
}

/// A single-attribute change with its desired absolute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "attribute", content = "value", rename_all = "kebab-case")]
pub enum Mutation {
    Suspend(bool),
    ImeiLock(bool),
    NetworkPreference(NetworkPreference),
    Package(u32),
}

impl Mutation {
    pub fn attribute(&self) -> Attribute {
        match self {
            Self::Suspend(_) => Attribute::Suspended,
            Self::ImeiLock(_) => Attribute::ImeiLocked,
            Self::NetworkPreference(_) => Attribute::NetworkPreference,
            Self::Package(_) => Attribute::Package,
        }
    }

    /// Parse a textual value for `attribute` (`true`/`on`/`yes`, a network
    /// name, or a package number).
    pub fn parse(attribute: Attribute, raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        let invalid = |expected: &str| CoreError::ValidationFailed {
            message: format!("invalid value '{raw}' for {attribute}: expected {expected}"),
        };
        match attribute {
            Attribute::Suspended => parse_flag(raw)
                .map(Self::Suspend)
                .ok_or_else(|| invalid("true or false")),
            Attribute::ImeiLocked => parse_flag(raw)
                .map(Self::ImeiLock)
                .ok_or_else(|| invalid("true or false")),
            Attribute::NetworkPreference => NetworkPreference::from_str(raw)
                .map(Self::NetworkPreference)
                .map_err(|_| invalid("auto, lte, 5g or 3g")),
            Attribute::Package => raw
                .parse::<u32>()
                .map(Self::Package)
                .map_err(|_| invalid("a package number")),
        }
    }

    /// Human-readable rendering of the value alone.
    pub fn value_string(&self) -> String {
        match self {
            Self::Suspend(v) | Self::ImeiLock(v) => v.to_string(),
            Self::NetworkPreference(v) => v.to_string(),
            Self::Package(v) => v.to_string(),
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attribute(), self.value_string())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// A full provider-side view of a line, as returned by a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSnapshot {
    pub line_id: LineId,
    pub endpoint_id: Option<EndpointId>,
    pub binding: BindingInfo,
    pub attributes: LineAttributes,
    pub fetched_at: DateTime<Utc>,
}

/// Per-attribute synchronization marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeMark {
    /// Line revision at which the attribute was last set optimistically.
    pub revision: u64,
    /// When the provider last confirmed a mutation of this attribute.
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Cached provider state of one line plus its synchronization metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLineState {
    pub line_id: LineId,
    pub endpoint_id: Option<EndpointId>,
    pub binding: Option<BindingInfo>,
    pub attributes: LineAttributes,
    /// Attributes with an unsettled mutation; refresh merges skip these.
    pub in_flight: BTreeSet<Attribute>,
    /// Attributes whose last mutation timed out and may or may not have
    /// reached the provider. Cleared by the next merge that writes them.
    pub unconfirmed: BTreeSet<Attribute>,
    pub marks: BTreeMap<Attribute, AttributeMark>,
    /// Bumped on every optimistic set and every settlement.
    pub revision: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub saga: Option<ReprovisioningRecord>,
}

impl DeviceLineState {
    pub fn new(line_id: LineId) -> Self {
        Self {
            line_id,
            endpoint_id: None,
            binding: None,
            attributes: LineAttributes::default(),
            in_flight: BTreeSet::new(),
            unconfirmed: BTreeSet::new(),
            marks: BTreeMap::new(),
            revision: 0,
            last_synced_at: None,
            saga: None,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.last_synced_at.is_some()
    }

    /// A reprovisioning is running (record exists and is not terminal).
    pub fn saga_in_progress(&self) -> bool {
        self.saga.as_ref().is_some_and(|r| !r.phase.is_terminal())
    }

    /// The old identity was terminated and no new one exists yet.
    pub fn identity_lost(&self) -> bool {
        self.saga
            .as_ref()
            .is_some_and(|r| r.phase == SagaPhase::FailedPartial)
    }

    /// Revision at which `attribute` was last set optimistically.
    pub fn touched_at(&self, attribute: Attribute) -> u64 {
        self.marks.get(&attribute).map_or(0, |m| m.revision)
    }
}
