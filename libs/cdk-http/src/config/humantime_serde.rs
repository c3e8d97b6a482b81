//! Serde adapter for `Duration` fields written as humantime strings (`"20s"`, `"1m 30s"`).
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Timeouts {
//!     #[serde(with = "humantime_serde")]
//!     connect: Duration,
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserializer, Serializer, de};

pub fn serialize<S>(value: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.collect_str(&humantime::format_duration(*value))
}

/// Accepts a humantime string, or a bare integer number of seconds.
pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl de::Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a duration such as \"5s\" or a number of seconds")
        }

        fn visit_str<E>(self, v: &str) -> Result<Duration, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v.trim())
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
        where
            E: de::Error,
        {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }
    }

    d.deserialize_any(DurationVisitor)
}
