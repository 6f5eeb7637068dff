//! Job descriptor construction, name validation, and idempotency keys.
//!
//! A [`JobDescriptor`] is created by the caller at the moment work must be
//! deferred and is immutable once enqueued. Its idempotency key is either
//! supplied explicitly or derived from the job name and arguments, so the
//! same logical work item always maps to the same key.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hashing::sha256_hex;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a job name.
const MAX_NAME_LEN: usize = 128;

/// Maximum number of arguments a descriptor may carry.
const MAX_ARGUMENTS: usize = 64;

// ---------------------------------------------------------------------------
// JobDescriptor
// ---------------------------------------------------------------------------

/// A unit of deferred work: a registered handler name plus the ordered
/// JSON arguments the handler will be invoked with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Name of the registered handler, e.g. `"create_snapshot"`.
    pub name: String,

    /// Ordered, JSON-serializable argument sequence.
    pub arguments: Vec<serde_json::Value>,

    /// Key used to detect duplicate executions of the same logical job.
    pub idempotency_key: String,
}

impl JobDescriptor {
    /// Create a descriptor with a derived idempotency key.
    pub fn new(
        name: impl Into<String>,
        arguments: Vec<serde_json::Value>,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        validate_job_name(&name)?;
        validate_arguments(&arguments)?;
        let idempotency_key = derive_idempotency_key(&name, &arguments);
        Ok(Self {
            name,
            arguments,
            idempotency_key,
        })
    }

    /// Create a descriptor with a caller-supplied idempotency key.
    ///
    /// Used when the caller has a natural dedup key (e.g. an export
    /// request id) that is stabler than the argument encoding.
    pub fn with_key(
        name: impl Into<String>,
        arguments: Vec<serde_json::Value>,
        idempotency_key: impl Into<String>,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        let idempotency_key = idempotency_key.into();
        validate_job_name(&name)?;
        validate_arguments(&arguments)?;
        if idempotency_key.is_empty() {
            return Err(CoreError::Validation(
                "Idempotency key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            arguments,
            idempotency_key,
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a job name.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_NAME_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_job_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Job name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Job name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "Job name may only contain alphanumeric, hyphen, underscore, or dot characters"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate a descriptor argument sequence.
pub fn validate_arguments(arguments: &[serde_json::Value]) -> Result<(), CoreError> {
    if arguments.len() > MAX_ARGUMENTS {
        return Err(CoreError::Validation(format!(
            "A job may have at most {MAX_ARGUMENTS} arguments"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Idempotency keys
// ---------------------------------------------------------------------------

/// Derive the default idempotency key for a job.
///
/// The key is `sha256(name ++ NUL ++ json(arguments))`. The NUL separator
/// keeps `("ab", [])` and `("a", ["b"])`-style collisions apart, and the
/// JSON encoding of an argument *sequence* is deterministic.
pub fn derive_idempotency_key(name: &str, arguments: &[serde_json::Value]) -> String {
    let encoded =
        serde_json::to_string(arguments).unwrap_or_else(|_| "[]".to_string());
    let mut input = Vec::with_capacity(name.len() + 1 + encoded.len());
    input.extend_from_slice(name.as_bytes());
    input.push(0);
    input.extend_from_slice(encoded.as_bytes());
    sha256_hex(&input)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::error::CoreError;

    // -- validate_job_name ----------------------------------------------------

    #[test]
    fn valid_job_name() {
        assert!(validate_job_name("devops.create_snapshot-v2").is_ok());
    }

    #[test]
    fn empty_job_name_rejected() {
        assert_matches!(validate_job_name(""), Err(CoreError::Validation(_)));
    }

    #[test]
    fn job_name_with_spaces_rejected() {
        assert!(validate_job_name("create snapshot").is_err());
    }

    #[test]
    fn job_name_too_long_rejected() {
        let name = "a".repeat(MAX_NAME_LEN + 1);
        assert!(validate_job_name(&name).is_err());
    }

    // -- derive_idempotency_key -----------------------------------------------

    #[test]
    fn key_is_stable_for_same_input() {
        let args = vec![json!(42), json!("export")];
        assert_eq!(
            derive_idempotency_key("approve_blocked_users", &args),
            derive_idempotency_key("approve_blocked_users", &args),
        );
    }

    #[test]
    fn key_differs_on_argument_change() {
        let a = derive_idempotency_key("create_snapshot", &[json!({"segment_id": 7})]);
        let b = derive_idempotency_key("create_snapshot", &[json!({"segment_id": 8})]);
        assert_ne!(a, b);
    }

    #[test]
    fn key_differs_on_name_change() {
        let args = vec![json!(1)];
        assert_ne!(
            derive_idempotency_key("export_csv", &args),
            derive_idempotency_key("export_json", &args),
        );
    }

    #[test]
    fn name_argument_boundary_does_not_collide() {
        assert_ne!(
            derive_idempotency_key("ab", &[]),
            derive_idempotency_key("a", &[json!("b")]),
        );
    }

    // -- JobDescriptor --------------------------------------------------------

    #[test]
    fn descriptor_derives_key() {
        let d = JobDescriptor::new("create_snapshot", vec![json!(7)]).unwrap();
        assert_eq!(d.idempotency_key.len(), 64);
        assert_eq!(
            d.idempotency_key,
            derive_idempotency_key("create_snapshot", &d.arguments)
        );
    }

    #[test]
    fn descriptor_accepts_explicit_key() {
        let d =
            JobDescriptor::with_key("export_csv", vec![json!(1)], "export-req-9").unwrap();
        assert_eq!(d.idempotency_key, "export-req-9");
    }

    #[test]
    fn descriptor_rejects_empty_explicit_key() {
        assert!(JobDescriptor::with_key("export_csv", vec![], "").is_err());
    }

    #[test]
    fn descriptor_rejects_invalid_name() {
        assert!(JobDescriptor::new("", vec![]).is_err());
    }
}
