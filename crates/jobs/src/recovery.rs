//! Failure classification.
//!
//! Every failed job runs through [`classify`]. Gateway failures during start
//! and stop are retried in place; storage exhaustion parks the sandbox in a
//! recoverable error; anything else is fatal. Matching is case-insensitive
//! substring search over the normalized error reason, so the same message
//! under the same operation always yields the same outcome.

use serde::{Deserialize, Serialize};

/// Which retry rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Start,
    Stop,
    Generic,
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "generic" => Ok(Self::Generic),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

/// Remediation a recoverable error is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryType {
    StorageExpansion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Re-run the same job after a backoff, up to the configured limit.
    RetryTransient,
    /// Park the sandbox in `error` with `recoverable = true`.
    Recoverable(RecoveryType),
    /// Park the sandbox in `error` with `recoverable = false`.
    Fatal,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetryTransient => f.write_str("retry-transient"),
            Self::Recoverable(RecoveryType::StorageExpansion) => {
                f.write_str("recoverable (STORAGE_EXPANSION)")
            },
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// The forms a failure reaches the dispatcher in.
#[derive(Debug)]
pub enum ErrorPayload<'a> {
    Text(&'a str),
    /// A JSON body returned by a runner, e.g. `{"message": "...", "recoverable": true}`.
    Structured(&'a serde_json::Value),
    Wrapped(&'a (dyn std::error::Error + 'static)),
}

/// A failure reduced to what is stored on the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedError {
    pub recoverable: bool,
    pub error_reason: String,
}

const START_TRANSIENT: &[&str] = &[
    "status code 502",
    "502 bad gateway",
    "econnreset",
    "connection reset",
];

const STOP_TRANSIENT: &[&str] = &[
    "status code 502",
    "502 bad gateway",
    "status code 504",
    "gateway timeout",
];

const STORAGE_EXHAUSTED: &[&str] = &[
    "no space left on device",
    "storage limit",
    "disk quota exceeded",
    "not enough disk space",
];

/// Reduce any payload to `{recoverable, error_reason}`.
///
/// Text that parses as a JSON object is treated as structured. Structured
/// payloads may carry their own `recoverable` flag; otherwise it is derived
/// from the reason. Wrapped errors contribute their whole source chain.
pub fn normalize(payload: &ErrorPayload<'_>) -> SanitizedError {
    match payload {
        ErrorPayload::Text(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) if value.is_object() => normalize(&ErrorPayload::Structured(&value)),
            _ => from_reason(text.trim().to_string(), None),
        },
        ErrorPayload::Structured(value) => {
            let reason = ["errorReason", "message", "error"]
                .iter()
                .find_map(|key| value.get(key).and_then(|v| v.as_str()))
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string());
            let flag = value.get("recoverable").and_then(|v| v.as_bool());
            from_reason(reason, flag)
        },
        ErrorPayload::Wrapped(err) => {
            let mut parts = vec![err.to_string()];
            let mut source = err.source();
            while let Some(inner) = source {
                let text = inner.to_string();
                if !parts.iter().any(|p| p.contains(&text)) {
                    parts.push(text);
                }
                source = inner.source();
            }
            from_reason(parts.join(": "), None)
        },
    }
}

fn from_reason(error_reason: String, flag: Option<bool>) -> SanitizedError {
    let recoverable = flag.unwrap_or_else(|| storage_exhausted(&error_reason));
    SanitizedError {
        recoverable,
        error_reason,
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    needles.iter().any(|n| haystack.contains(n))
}

fn storage_exhausted(reason: &str) -> bool {
    contains_any(reason, STORAGE_EXHAUSTED)
}

/// Decide what to do with a failure of an `op` job.
pub fn classify(op: OperationKind, payload: &ErrorPayload<'_>) -> Classification {
    classify_sanitized(op, &normalize(payload))
}

pub fn classify_sanitized(op: OperationKind, error: &SanitizedError) -> Classification {
    if error.recoverable {
        return Classification::Recoverable(RecoveryType::StorageExpansion);
    }
    let transient: &[&str] = match op {
        OperationKind::Start => START_TRANSIENT,
        OperationKind::Stop => STOP_TRANSIENT,
        OperationKind::Generic => &[],
    };
    if contains_any(&error.error_reason, transient) {
        return Classification::RetryTransient;
    }
    Classification::Fatal
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    #[rstest]
    #[case::start_502(OperationKind::Start, "Request failed with status code 502", Classification::RetryTransient)]
    #[case::stop_502(OperationKind::Stop, "Request failed with status code 502", Classification::RetryTransient)]
    #[case::generic_502(OperationKind::Generic, "Request failed with status code 502", Classification::Fatal)]
    #[case::stop_504(OperationKind::Stop, "request failed with status code 504: upstream", Classification::RetryTransient)]
    #[case::start_504(OperationKind::Start, "request failed with status code 504: upstream", Classification::Fatal)]
    #[case::start_reset(OperationKind::Start, "read ECONNRESET", Classification::RetryTransient)]
    #[case::stop_reset(OperationKind::Stop, "read ECONNRESET", Classification::Fatal)]
    #[case::no_space(OperationKind::Start, "No space left on device", Classification::Recoverable(RecoveryType::StorageExpansion))]
    #[case::quota(OperationKind::Generic, "write failed: Disk quota exceeded", Classification::Recoverable(RecoveryType::StorageExpansion))]
    #[case::storage_limit(OperationKind::Stop, "Storage limit reached", Classification::Recoverable(RecoveryType::StorageExpansion))]
    #[case::permission(OperationKind::Start, "permission denied", Classification::Fatal)]
    fn classifies_text(#[case] op: OperationKind, #[case] msg: &str, #[case] expected: Classification) {
        assert_eq!(classify(op, &ErrorPayload::Text(msg)), expected);
        assert_eq!(classify(op, &ErrorPayload::Text(msg)), expected);
    }

    #[test]
    fn structured_payload_uses_message_and_flag() {
        let body = json!({"message": "volume gone", "recoverable": true});
        let sanitized = normalize(&ErrorPayload::Structured(&body));
        assert_eq!(sanitized, SanitizedError {
            recoverable: true,
            error_reason: "volume gone".into(),
        });

        let body = json!({"errorReason": "no space left on device"});
        assert!(normalize(&ErrorPayload::Structured(&body)).recoverable);
    }

    #[test]
    fn json_text_is_treated_as_structured() {
        let text = r#"{"error": "Request failed with status code 502"}"#;
        let sanitized = normalize(&ErrorPayload::Text(text));
        assert_eq!(sanitized.error_reason, "Request failed with status code 502");
        assert_eq!(
            classify(OperationKind::Start, &ErrorPayload::Text(text)),
            Classification::RetryTransient
        );
    }

    #[test]
    fn structured_without_known_keys_falls_back_to_json() {
        let body = json!({"code": 17});
        assert_eq!(normalize(&ErrorPayload::Structured(&body)).error_reason, r#"{"code":17}"#);
    }

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl std::fmt::Display for Outer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("failed to extract layer")
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn wrapped_error_includes_source_chain() {
        let err = Outer(std::io::Error::other("No space left on device"));
        let sanitized = normalize(&ErrorPayload::Wrapped(&err));
        assert_eq!(
            sanitized.error_reason,
            "failed to extract layer: No space left on device"
        );
        assert!(sanitized.recoverable);
    }
}
