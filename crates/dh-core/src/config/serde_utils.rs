//! Serde helpers for configuration values
//!
//! Durations are written as plain integers so config files stay readable:
//! `startup_timeout = 30` next to `health_timeout = 500`.

macro_rules! duration_as_integer {
    ($name:ident, $unit:literal, $to:expr, $from:path) => {
        #[doc = concat!("`Duration` stored as whole ", $unit)]
        pub mod $name {
            use serde::{Deserialize, Deserializer, Serializer};
            use std::time::Duration;

            pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                let to_integer: fn(&Duration) -> u64 = $to;
                serializer.serialize_u64(to_integer(value))
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
            where
                D: Deserializer<'de>,
            {
                u64::deserialize(deserializer).map($from)
            }
        }
    };
}

duration_as_integer!(duration_secs, "seconds", |d| d.as_secs(), Duration::from_secs);
duration_as_integer!(
    duration_millis,
    "milliseconds",
    |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
    Duration::from_millis
);
