// Tenant identity.
//
// A tenant key is either an access token or a platform username. Because
// it may be a credential, `Debug` and log output only ever show the
// redacted form.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of leading characters kept visible by [`TenantKey::redacted`].
const VISIBLE_PREFIX_CHARS: usize = 4;

/// Opaque identifier partitioning all relay state.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey(Arc<str>);

impl TenantKey {
    pub fn new(value: impl AsRef<str>) -> Self {
        Self(Arc::from(value.as_ref().trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prefix of the key followed by `***`, safe to log and show on
    /// operator pages.
    pub fn redacted(&self) -> String {
        let visible: String = self.0.chars().take(VISIBLE_PREFIX_CHARS).collect();
        if visible.len() == self.0.len() {
            return "***".to_string();
        }
        format!("{visible}***")
    }
}

impl fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TenantKey").field(&self.redacted()).finish()
    }
}

impl From<&str> for TenantKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TenantKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Serialize for TenantKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TenantKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}
