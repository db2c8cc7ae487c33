//! Identifier newtypes and the topic naming scheme.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrows the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the identifier is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Logical recipient of consolidated broadcasts (one per end-user).
    SubscriberId
);
string_id!(
    /// Physical device identity; also the rate-limited origin.
    DeviceId
);
string_id!(
    /// A sensor attached to a device.
    SensorId
);

/// An addressable broadcast channel.
///
/// Rendered with the stable naming scheme clients subscribe with:
/// `user:{id}`, `device:{id}`, `sensor:{id}` and `user:{id}:dashboard`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Consolidated batch updates for one subscriber.
    User(SubscriberId),
    /// Status updates for one device.
    Device(DeviceId),
    /// Data points for one sensor.
    Sensor(SensorId),
    /// Dashboard snapshots for one subscriber.
    Dashboard(SubscriberId),
}

impl Topic {
    /// Subscriber a private topic belongs to. Device and sensor topics are
    /// shared and have no owner.
    pub fn owner(&self) -> Option<&SubscriberId> {
        match self {
            Topic::User(id) | Topic::Dashboard(id) => Some(id),
            Topic::Device(_) | Topic::Sensor(_) => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::User(id) => write!(f, "user:{}", id),
            Topic::Device(id) => write!(f, "device:{}", id),
            Topic::Sensor(id) => write!(f, "sensor:{}", id),
            Topic::Dashboard(id) => write!(f, "user:{}:dashboard", id),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| format!("Topic must be '<kind>:<id>': {}", s))?;
        if rest.trim().is_empty() {
            return Err(format!("Topic has an empty id: {}", s));
        }

        match kind {
            "user" => match rest.strip_suffix(":dashboard") {
                Some(id) if !id.is_empty() => Ok(Topic::Dashboard(SubscriberId::new(id))),
                _ => Ok(Topic::User(SubscriberId::new(rest))),
            },
            "device" => Ok(Topic::Device(DeviceId::new(rest))),
            "sensor" => Ok(Topic::Sensor(SensorId::new(rest))),
            other => Err(format!("Unknown topic kind '{}' in {}", other, s)),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
