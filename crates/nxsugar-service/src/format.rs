use std::time::Duration;

/// Render a duration the way logs and errors show it: `0.5000s`, `20s`, `2m5s`, `1h1m1s`.
pub fn format_secs(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 1.0 {
        return format!("{:.4}s", secs);
    }
    if secs < 60.0 {
        return format!("{:.0}s", secs);
    }

    let total = secs.round() as u64;
    let (hours, mins, rsecs) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if mins > 0 {
        out.push_str(&format!("{}m", mins));
    }
    if rsecs > 0 {
        out.push_str(&format!("{}s", rsecs));
    }
    out
}

/// Seconds as a float, the unit durations are configured in.
pub(crate) mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!("must be a positive number of seconds, got {}", secs))
        })
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs_f64()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(d)?
                .map(|secs| {
                    Duration::try_from_secs_f64(secs).map_err(|_| {
                        serde::de::Error::custom(format!(
                            "must be a positive number of seconds, got {}",
                            secs
                        ))
                    })
                })
                .transpose()
        }
    }
}
