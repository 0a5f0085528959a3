//! Versioned payload encoding for cached objects.
//!
//! Every serialised value is wrapped in `{ "v": <version>, "kind": <kind>, "data": ... }`.
//! Bumping [`Versioned::VERSION`] after a format change turns old entries into
//! misses instead of decode garbage.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{FollowerInfo, TrendingTopic};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialise `{kind}` payload: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed `{kind}` payload: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("payload kind mismatch: expected `{expected}`, found `{found}`")]
    KindMismatch { expected: &'static str, found: String },
    #[error("`{kind}` payload version {found} does not match current version {expected}")]
    VersionMismatch {
        kind: &'static str,
        expected: u16,
        found: u16,
    },
}

/// A cacheable type with a stable kind tag and schema version.
pub trait Versioned: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const VERSION: u16;
}

impl Versioned for FollowerInfo {
    const KIND: &'static str = "follower_info";
    const VERSION: u16 = 1;
}

/// Ranked trending list as stored under one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendingSnapshot {
    pub topics: Vec<TrendingTopic>,
}

impl Versioned for TrendingSnapshot {
    const KIND: &'static str = "trending_snapshot";
    const VERSION: u16 = 1;
}

/// Long-lived fallback copy of a primary cache value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord<T> {
    pub data: T,
    /// Unix milliseconds on the wire, matching `last_updated`.
    #[serde(with = "time::serde::timestamp::milliseconds")]
    pub timestamp: OffsetDateTime,
}

impl<T: Versioned> Versioned for BackupRecord<T> {
    const KIND: &'static str = T::KIND;
    const VERSION: u16 = T::VERSION;
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u16,
    kind: &'a str,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    v: u16,
    kind: String,
    data: serde_json::Value,
}

pub fn encode<T: Versioned>(value: &T) -> Result<Bytes, CodecError> {
    let envelope = EnvelopeRef {
        v: T::VERSION,
        kind: T::KIND,
        data: value,
    };
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|source| CodecError::Encode {
            kind: T::KIND,
            source,
        })
}

pub fn decode<T: Versioned>(bytes: &[u8]) -> Result<T, CodecError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|source| CodecError::Malformed {
            kind: T::KIND,
            source,
        })?;

    if envelope.kind != T::KIND {
        return Err(CodecError::KindMismatch {
            expected: T::KIND,
            found: envelope.kind,
        });
    }
    if envelope.v != T::VERSION {
        return Err(CodecError::VersionMismatch {
            kind: T::KIND,
            expected: T::VERSION,
            found: envelope.v,
        });
    }

    serde_json::from_value(envelope.data).map_err(|source| CodecError::Malformed {
        kind: T::KIND,
        source,
    })
}

/// Counters are stored as decimal strings so INCRBY keeps working on them.
pub fn decode_counter(bytes: &[u8]) -> Option<u64> {
    let value: i64 = std::str::from_utf8(bytes).ok()?.trim().parse().ok()?;
    Some(u64::try_from(value).unwrap_or(0))
}

/// Timestamps are stored as unix milliseconds.
pub fn encode_timestamp(at: OffsetDateTime) -> Bytes {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    Bytes::from(millis.to_string())
}

pub fn decode_timestamp(bytes: &[u8]) -> Option<OffsetDateTime> {
    let millis: i128 = std::str::from_utf8(bytes).ok()?.trim().parse().ok()?;
    OffsetDateTime::from_unix_timestamp_nanos(millis.checked_mul(1_000_000)?).ok()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn follower_info_survives_the_envelope() {
        let info = FollowerInfo {
            followers: 12,
            is_followed_by_user: true,
        };
        let bytes = encode(&info).expect("encode");
        let text = std::str::from_utf8(&bytes).expect("utf8");
        assert!(text.contains("\"kind\":\"follower_info\""));
        assert_eq!(decode::<FollowerInfo>(&bytes).expect("decode"), info);
    }

    #[test]
    fn stale_versions_are_rejected() {
        let payload = br#"{"v":0,"kind":"follower_info","data":{"followers":1,"is_followed_by_user":false}}"#;
        assert!(matches!(
            decode::<FollowerInfo>(payload),
            Err(CodecError::VersionMismatch {
                expected: 1,
                found: 0,
                ..
            })
        ));
    }

    #[test]
    fn other_kinds_are_rejected() {
        let snapshot = TrendingSnapshot { topics: Vec::new() };
        let bytes = encode(&snapshot).expect("encode");
        assert!(matches!(
            decode::<FollowerInfo>(&bytes),
            Err(CodecError::KindMismatch { .. })
        ));
    }

    #[test]
    fn backup_is_not_mistaken_for_primary() {
        let record = BackupRecord {
            data: FollowerInfo {
                followers: 3,
                is_followed_by_user: false,
            },
            timestamp: datetime!(2024-01-01 00:00 UTC),
        };
        let bytes = encode(&record).expect("encode");
        assert!(matches!(
            decode::<FollowerInfo>(&bytes),
            Err(CodecError::Malformed { .. })
        ));
        assert_eq!(
            decode::<BackupRecord<FollowerInfo>>(&bytes).expect("decode"),
            record
        );
    }

    #[test]
    fn backup_timestamps_keep_milliseconds() {
        let at = datetime!(2024-03-04 05:06:07.123 UTC);
        let record = BackupRecord {
            data: TrendingSnapshot { topics: Vec::new() },
            timestamp: at,
        };
        let bytes = encode(&record).expect("encode");

        let text = std::str::from_utf8(&bytes).expect("utf-8");
        assert!(text.contains("1709528767123"), "{text}");
        let decoded = decode::<BackupRecord<TrendingSnapshot>>(&bytes).expect("decode");
        assert_eq!(decoded.timestamp, at);
        assert_eq!(Some(decoded.timestamp), decode_timestamp(&encode_timestamp(at)));
    }

    #[test]
    fn counters_and_timestamps_use_plain_text() {
        assert_eq!(decode_counter(b"17"), Some(17));
        assert_eq!(decode_counter(b"-4"), Some(0));
        assert_eq!(decode_counter(b"x"), None);

        let at = datetime!(2024-03-04 05:06:07.123 UTC);
        let bytes = encode_timestamp(at);
        assert_eq!(decode_timestamp(&bytes), Some(at));
    }
}
