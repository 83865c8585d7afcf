//! Core domain types for intempt
//!
//! | Term | Definition |
//! |------|------------|
//! | **Collection** | A named schema grouping of tracked event properties |
//! | **Event** | One record destined for a collection, stamped with the visitor id |
//! | **Visitor** | The end-user behind a device, identified by a durable UUID |
//! | **Beacon region** | A Bluetooth proximity zone identified by UUID/major/minor |
//! | **Proximity** | Qualitative distance estimate reported for a beacon |

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

// ============================================
// Events
// ============================================

/// Event properties, in the order the caller supplied them.
///
/// Keyed properties serialize as a JSON object; positional properties
/// serialize as a JSON array whose slots line up with the collection schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Properties {
    Keyed(Vec<(String, serde_json::Value)>),
    Positional(Vec<serde_json::Value>),
}

impl Properties {
    pub fn len(&self) -> usize {
        match self {
            Properties::Keyed(pairs) => pairs.len(),
            Properties::Positional(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build keyed properties from any `(key, value)` iterator.
    ///
    /// A repeated key keeps its first position and its last value.
    pub fn keyed<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        Properties::Keyed(dedup_keys(
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())),
        ))
    }
}

/// Collapse repeated keys: first position, last value wins
pub(crate) fn dedup_keys<I>(pairs: I) -> Vec<(String, serde_json::Value)>
where
    I: IntoIterator<Item = (String, serde_json::Value)>,
{
    let mut unique: Vec<(String, serde_json::Value)> = Vec::new();
    for (key, value) in pairs {
        match unique.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => unique.push((key, value)),
        }
    }
    unique
}

impl Serialize for Properties {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Properties::Keyed(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (key, value) in pairs {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Properties::Positional(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for value in values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Properties {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PropertiesVisitor;

        impl<'de> Visitor<'de> for PropertiesVisitor {
            type Value = Properties;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object or array of properties")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Properties, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry()? {
                    pairs.push((key, value));
                }
                Ok(Properties::Keyed(dedup_keys(pairs)))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Properties, A::Error> {
                let mut values = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(value) = access.next_element()? {
                    values.push(value);
                }
                Ok(Properties::Positional(values))
            }
        }

        deserializer.deserialize_any(PropertiesVisitor)
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for Properties {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        Properties::Keyed(map.into_iter().collect())
    }
}

/// A captured event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub collection_name: String,
    pub properties: Properties,
    pub visitor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ============================================
// Beacons
// ============================================

/// A Bluetooth beacon region.
///
/// Regions registered for monitoring may leave `major`/`minor` unset to
/// match every beacon broadcasting the UUID. Samples always carry both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeaconRegion {
    pub uuid: Uuid,
    pub major: Option<u16>,
    pub minor: Option<u16>,
}

impl BeaconRegion {
    /// Region matching every beacon with this UUID
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            major: None,
            minor: None,
        }
    }

    /// A concrete beacon
    pub fn beacon(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            major: Some(major),
            minor: Some(minor),
        }
    }

    /// Whether `other` falls inside this region
    pub fn matches(&self, other: &BeaconRegion) -> bool {
        self.uuid == other.uuid
            && self.major.map_or(true, |m| other.major == Some(m))
            && self.minor.map_or(true, |m| other.minor == Some(m))
    }
}

impl fmt::Display for BeaconRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)?;
        match (self.major, self.minor) {
            (Some(major), Some(minor)) => write!(f, "/{}/{}", major, minor),
            (Some(major), None) => write!(f, "/{}", major),
            _ => Ok(()),
        }
    }
}

/// Raw proximity reported by the radio stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proximity {
    Unknown,
    Far,
    Near,
    Immediate,
}

impl Proximity {
    /// Which committed state this reading points towards
    pub fn facing(self) -> ProximityState {
        match self {
            Proximity::Unknown | Proximity::Far => ProximityState::Outside,
            Proximity::Near | Proximity::Immediate => ProximityState::Inside,
        }
    }
}

/// Committed per-region state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProximityState {
    #[default]
    Unknown,
    Outside,
    Inside,
}

// ============================================
// Location
// ============================================

/// Location authorization level the app may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthorizationLevel {
    WhenInUse,
    Always,
}

/// Authorization state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthorizationStatus {
    #[default]
    NotDetermined,
    Denied,
    Restricted,
    WhenInUse,
    Always,
}

impl AuthorizationStatus {
    pub fn is_granted(self) -> bool {
        matches!(
            self,
            AuthorizationStatus::WhenInUse | AuthorizationStatus::Always
        )
    }
}

/// A location fix pushed by the platform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}
