//! Common types shared between the quota engine and its callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Countable resource kind a quota can cap
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Cpu,         // CPU shares in MHz
    Cores,       // Dedicated cores
    MemoryMb,    // Reserved memory
    MemoryMaxMb, // Memory oversubscription ceiling
    DiskMb,      // Ephemeral disk
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::Cpu,
        Dimension::Cores,
        Dimension::MemoryMb,
        Dimension::MemoryMaxMb,
        Dimension::DiskMb,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cores => "cores",
            Self::MemoryMb => "memory_mb",
            Self::MemoryMaxMb => "memory_max_mb",
            Self::DiskMb => "disk_mb",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Dimension::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown resource dimension '{}'", s)))
    }
}

/// Cap on one dimension of a quota limit
///
/// Finite caps are signed so that a negative value supplied by a caller
/// survives decoding and is rejected by validation instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "CapRepr", into = "CapRepr")]
pub enum Cap {
    Limited(i64),
    #[default]
    Unlimited,
}

/// Wire form of [`Cap`]: an integer or the keyword `"unlimited"`
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CapRepr {
    Amount(i64),
    Keyword(String),
}

impl TryFrom<CapRepr> for Cap {
    type Error = String;

    fn try_from(repr: CapRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            CapRepr::Amount(n) => Ok(Cap::Limited(n)),
            CapRepr::Keyword(k) if k.eq_ignore_ascii_case("unlimited") => Ok(Cap::Unlimited),
            CapRepr::Keyword(k) => Err(format!(
                "invalid cap '{}': expected an integer or \"unlimited\"",
                k
            )),
        }
    }
}

impl From<Cap> for CapRepr {
    fn from(cap: Cap) -> Self {
        match cap {
            Cap::Limited(n) => CapRepr::Amount(n),
            Cap::Unlimited => CapRepr::Keyword("unlimited".to_string()),
        }
    }
}

impl Cap {
    /// Finite ceiling, `None` when unlimited. Negative caps read as zero.
    pub fn limit(&self) -> Option<u64> {
        match self {
            Cap::Limited(n) => Some(u64::try_from(*n).unwrap_or(0)),
            Cap::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Cap::Unlimited)
    }

    /// Room left under this cap given current usage
    pub fn available(&self, used: u64) -> Option<u64> {
        self.limit().map(|limit| limit.saturating_sub(used))
    }

    /// Whether `requested` more units fit on top of `used`.
    /// A total past `u64::MAX` never fits, not even under an unlimited cap.
    pub fn admits(&self, used: u64, requested: u64) -> bool {
        match used.checked_add(requested) {
            Some(total) => self.limit().map_or(true, |limit| total <= limit),
            None => false,
        }
    }

    /// Room reported when `admits` refuses: the cap's headroom, or what is
    /// left of the counter range for an unlimited cap
    pub fn headroom(&self, used: u64) -> u64 {
        self.available(used).unwrap_or(u64::MAX - used)
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cap::Limited(n) => write!(f, "{}", n),
            Cap::Unlimited => write!(f, "unlimited"),
        }
    }
}

/// Amounts per dimension
///
/// Used both as the delta of a reservation and as the counters of a ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<Dimension, u64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dimension: Dimension, amount: u64) -> Self {
        self.set(dimension, amount);
        self
    }

    pub fn get(&self, dimension: Dimension) -> u64 {
        self.0.get(&dimension).copied().unwrap_or(0)
    }

    pub fn set(&mut self, dimension: Dimension, amount: u64) {
        if amount == 0 {
            self.0.remove(&dimension);
        } else {
            self.0.insert(dimension, amount);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dimension, u64)> + '_ {
        self.0.iter().map(|(d, v)| (*d, *v))
    }

    /// Dimensions with a non-zero amount
    pub fn dimensions(&self) -> impl Iterator<Item = Dimension> + '_ {
        self.0.iter().filter(|(_, v)| **v > 0).map(|(d, _)| *d)
    }

    /// True when every amount is zero
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    /// Saturating sum of two amount maps
    pub fn merge(&mut self, other: &Resources) {
        for (dimension, amount) in other.iter() {
            let current = self.get(dimension);
            self.set(dimension, current.saturating_add(amount));
        }
    }

    /// Exact sum of two amount maps, or the first dimension that overflows
    pub fn checked_sum(&self, other: &Resources) -> std::result::Result<Resources, Dimension> {
        let mut sum = self.clone();
        for (dimension, amount) in other.iter() {
            let total = self.get(dimension).checked_add(amount).ok_or(dimension)?;
            sum.set(dimension, total);
        }
        Ok(sum)
    }
}

impl FromIterator<(Dimension, u64)> for Resources {
    fn from_iter<I: IntoIterator<Item = (Dimension, u64)>>(iter: I) -> Self {
        Resources(iter.into_iter().collect())
    }
}

/// Limits of a quota within one scope (region or partition)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimit {
    pub scope: String,
    #[serde(default)]
    pub caps: BTreeMap<Dimension, Cap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QuotaLimit {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            caps: BTreeMap::new(),
            description: None,
        }
    }

    pub fn with_cap(mut self, dimension: Dimension, cap: Cap) -> Self {
        self.caps.insert(dimension, cap);
        self
    }

    /// Cap for a dimension; dimensions without an entry are unlimited
    pub fn cap(&self, dimension: Dimension) -> Cap {
        self.caps.get(&dimension).copied().unwrap_or_default()
    }
}

/// Named quota with one limit per scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpecification {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub limits: Vec<QuotaLimit>,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
}

impl QuotaSpecification {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            limits: Vec::new(),
            create_index: 0,
            modify_index: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_limit(mut self, limit: QuotaLimit) -> Self {
        self.limits.push(limit);
        self
    }

    pub fn limit_for(&self, scope: &str) -> Option<&QuotaLimit> {
        self.limits.iter().find(|l| l.scope == scope)
    }

    /// Compare everything except the store-assigned indexes
    pub fn same_content(&self, other: &QuotaSpecification) -> bool {
        self.name == other.name && self.description == other.description && self.limits == other.limits
    }
}

/// Usage of one dimension against its cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionUsage {
    pub used: u64,
    /// `None` when the scope is no longer declared by the specification
    pub limit: Option<Cap>,
}

impl DimensionUsage {
    pub fn available(&self) -> Option<u64> {
        self.limit.and_then(|cap| cap.available(self.used))
    }
}

/// Usage of every dimension within one scope, read at a single instant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeUsage {
    pub dimensions: BTreeMap<Dimension, DimensionUsage>,
}

impl ScopeUsage {
    pub fn used(&self, dimension: Dimension) -> u64 {
        self.dimensions.get(&dimension).map(|d| d.used).unwrap_or(0)
    }
}

/// Point-in-time usage report for a quota
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsageSnapshot {
    pub name: String,
    pub modify_index: u64,
    pub scopes: BTreeMap<String, ScopeUsage>,
    pub taken_at: DateTime<Utc>,
}

impl QuotaUsageSnapshot {
    pub fn used(&self, scope: &str, dimension: Dimension) -> u64 {
        self.scopes.get(scope).map(|s| s.used(dimension)).unwrap_or(0)
    }

    /// True when nothing is reserved in any scope
    pub fn is_idle(&self) -> bool {
        self.scopes
            .values()
            .all(|s| s.dimensions.values().all(|d| d.used == 0))
    }
}

/// Specification together with its current usage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaInspection {
    pub spec: QuotaSpecification,
    pub usage: QuotaUsageSnapshot,
}

/// Proposed claim against a quota scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub quota: String,
    pub scope: String,
    pub resources: Resources,
}

impl ReservationRequest {
    pub fn new(quota: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            quota: quota.into(),
            scope: scope.into(),
            resources: Resources::new(),
        }
    }

    pub fn with(mut self, dimension: Dimension, amount: u64) -> Self {
        self.resources.set(dimension, amount);
        self
    }
}

/// Committed claim held by one allocation until released
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub quota: String,
    pub scope: String,
    pub resources: Resources,
    pub created_at: DateTime<Utc>,
}

/// Quota engine error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "Quota '{quota}' exceeded in scope '{scope}' for {dimension}: requested {requested}, available {available}"
    )]
    QuotaExceeded {
        quota: String,
        scope: String,
        dimension: Dimension,
        requested: u64,
        available: u64,
    },

    #[error("Backend unavailable: {0}")]
    InternalUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn quota_not_found(name: &str) -> Self {
        Error::NotFound(format!("quota '{}' not found", name))
    }

    /// Stable code for programmatic handling by callers
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Error::InternalUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Only backend failures are worth retrying, and only by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::InternalUnavailable(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InternalUnavailable(format!("corrupt stored record: {}", err))
    }
}
