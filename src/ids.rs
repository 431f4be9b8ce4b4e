use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::Result;

/// Record id prefixes. The full id shape is
/// `<prefix>-YYYYMMDD-HHMMSS-<rand8hex>`, which sorts chronologically as a
/// plain string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    Memory,
    Chunk,
    Artifact,
    StateHistory,
}

impl IdPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "M",
            Self::Chunk => "C",
            Self::Artifact => "A",
            Self::StateHistory => "S",
        }
    }
}

/// Generate a fresh record id using OS-backed CSPRNG entropy for the suffix.
pub fn generate(prefix: IdPrefix) -> Result<String> {
    generate_at(prefix, Utc::now())
}

/// Deterministic-timestamp variant, also used by tests.
pub fn generate_at(prefix: IdPrefix, at: DateTime<Utc>) -> Result<String> {
    let mut bytes = [0_u8; 4];
    getrandom::fill(&mut bytes)
        .map_err(|e| std::io::Error::other(format!("random source unavailable: {e}")))?;
    Ok(format!(
        "{}-{}-{}",
        prefix.as_str(),
        at.format("%Y%m%d-%H%M%S"),
        hex::encode(bytes)
    ))
}

/// Canonical wall-clock string: RFC 3339, nanosecond precision, UTC `Z`.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

/// Parse a stored canonical timestamp, tolerating legacy second precision.
/// Falls back to the epoch rather than failing a read path.
pub fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn id_shape_is_prefix_date_time_rand() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let id = generate_at(IdPrefix::Memory, at).unwrap();
        assert!(id.starts_with("M-20260314-092653-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();
        let a = generate_at(IdPrefix::Chunk, early).unwrap();
        let b = generate_at(IdPrefix::Chunk, late).unwrap();
        assert!(a < b);
    }

    #[test]
    fn timestamp_has_nanosecond_precision_and_z() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'));
        let frac = ts.split('.').nth(1).unwrap();
        assert_eq!(frac.trim_end_matches('Z').len(), 9);
    }

    #[test]
    fn timestamp_round_trips() {
        let now = Utc::now();
        let parsed = parse_timestamp(&timestamp(now));
        assert_eq!(parsed, now);
    }

    #[test]
    fn bad_timestamp_parses_to_epoch() {
        assert_eq!(parse_timestamp("garbage"), DateTime::<Utc>::UNIX_EPOCH);
    }
}
