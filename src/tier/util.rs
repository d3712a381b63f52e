use crate::error::{TierError, TierResult};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Return the current Unix epoch in seconds.
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Streamed SHA-256 of a file; media files are far too large to read whole.
pub fn file_hash(path: &Path) -> TierResult<String> {
    let mut file = File::open(path).map_err(|err| TierError::fs("open", path, err))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|err| TierError::fs("hash", path, err))?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn file_size(path: &Path) -> TierResult<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|err| TierError::fs("stat", path, err))
}

pub fn modified_at(path: &Path) -> TierResult<DateTime<Utc>> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|err| TierError::fs("stat", path, err))?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Size match is always required; hash match only when asked for.
pub fn same_content(a: &Path, b: &Path, with_hash: bool) -> TierResult<bool> {
    if file_size(a)? != file_size(b)? {
        return Ok(false);
    }
    if !with_hash {
        return Ok(true);
    }
    Ok(file_hash(a)? == file_hash(b)?)
}

/// Human-readable age, as the maintenance page shows it.
pub fn age_display(age_secs: i64) -> String {
    if age_secs < 60 {
        "just now".to_string()
    } else if age_secs < 3600 {
        format!("{} min ago", age_secs / 60)
    } else {
        format!("{} hr ago", age_secs / 3600)
    }
}

/// Serde adapter for ledger timestamps: written as RFC 3339, read from RFC 3339
/// or from the legacy offset-less ISO-8601 form (interpreted as local time).
pub mod iso_time {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
            .ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|ts| ts.with_timezone(&Utc))
    }

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339()
    }

    pub mod option {
        use super::*;

        pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(ts) => serializer.serialize_str(&super::format(ts)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw {
                None => Ok(None),
                Some(raw) => super::parse(&raw).map(Some).ok_or_else(|| {
                    serde::de::Error::custom(format!("invalid timestamp `{raw}`"))
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn age_display_buckets() {
        assert_eq!(age_display(5), "just now");
        assert_eq!(age_display(150), "2 min ago");
        assert_eq!(age_display(7300), "2 hr ago");
    }

    #[test]
    fn iso_time_accepts_legacy_naive_form() {
        assert!(iso_time::parse("2025-01-31T10:15:00.123456").is_some());
        assert!(iso_time::parse("2025-01-31T10:15:00+00:00").is_some());
        assert!(iso_time::parse("yesterday").is_none());
    }

    #[test]
    fn same_content_compares_size_then_hash() {
        let tmp = tempdir().expect("tempdir");
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        let c = tmp.path().join("c");
        fs::write(&a, b"abcd").expect("write a");
        fs::write(&b, b"abce").expect("write b");
        fs::write(&c, b"abcdef").expect("write c");

        assert!(same_content(&a, &b, false).expect("size"));
        assert!(!same_content(&a, &b, true).expect("hash"));
        assert!(!same_content(&a, &c, false).expect("size"));
    }
}
