//! Serialize a [`Duration`] as integer milliseconds.
//!
//! Use with `#[serde(with = "switchwire_core::serde_duration")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Wrap {
        #[serde(with = "super")]
        d: Duration,
    }

    #[test]
    fn millis() {
        let w: Wrap = serde_json::from_str(r#"{"d":1500}"#).unwrap();
        assert_eq!(w.d, Duration::from_millis(1500));
        assert_eq!(serde_json::to_string(&w).unwrap(), r#"{"d":1500}"#);
    }
}
