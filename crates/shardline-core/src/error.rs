//! Error types for the execution core
//!
//! All fallible operations return `Result<T, Error>`. The variants follow the
//! fault taxonomy of the chain: objective protocol violations that every node
//! reproduces, subjective (node-local) rejections, and fatal faults that must
//! bypass trace capture entirely.

use thiserror::Error;

use crate::action::PermissionLevel;
use crate::name::Name;
use crate::store::StoreError;

/// Execution core error types
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Required authority absent from the action's authorization list
    #[error("missing authority of {}", format_authority(.account, .permission))]
    MissingAuth {
        account: Name,
        permission: Option<Name>,
    },

    /// Action or inline action failed structural validation
    #[error("action validation failed: {0}")]
    ActionValidate(String),

    /// Inline action payload over the non-privileged size cap
    #[error("inline action too big for nonprivileged account {account}")]
    InlineActionTooBig { account: Name },

    /// Storage billed to another account without its consent
    #[error("unauthorized ram usage increase: {0}")]
    UnauthorizedRamUsageIncrease(String),

    /// Generic transaction-level fault (read-only violations, depth limit)
    #[error("transaction exception: {0}")]
    Transaction(String),

    /// Generated transactions may not carry context-free actions
    #[error("context free actions are not currently allowed in generated transactions")]
    CfaInsideGeneratedTx,

    /// Unsupported, duplicated or out-of-order transaction extension
    #[error("invalid transaction extension: {0}")]
    InvalidTransactionExtension(String),

    /// Generation-context extension does not match the sending context
    #[error(
        "deferred transaction generation context contains mismatching {field} (expected {expected}, actual {actual})"
    )]
    IllFormedGenerationContext {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// A deferred transaction with the same (sender, sender_id) exists
    #[error("deferred transaction with the same sender_id and payer already exists")]
    DeferredTxDuplicate,

    /// Node-local policy rejection, distinct from objective failures
    #[error("subjective block production exception: {message}")]
    SubjectiveBlockProduction { message: String, log: Vec<String> },

    /// Authorization policy rejected the declared authorities
    #[error("unsatisfied authorization: {0}")]
    UnsatisfiedAuthorization(String),

    /// Cooperative deadline check failed
    #[error("transaction deadline exceeded")]
    DeadlineExceeded,

    /// Net usage charged beyond the transaction's limit
    #[error("transaction net usage {used} exceeds limit {limit}")]
    NetUsageExceeded { used: u64, limit: u64 },

    /// Raw action introspection with an unknown action type
    #[error("action is not found")]
    ActionNotFound,

    /// Contract-raised assertion carrying a numeric code
    #[error("assertion failure with error code: {code}: {message}")]
    AssertCode { code: u64, message: String },

    /// Interpreter refused or failed to run contract code
    #[error("interpreter error: {0}")]
    Interpreter(String),

    /// Actor white/blacklist violation
    #[error("actor list violation: {0}")]
    ActorList(String),

    /// Contract white/blacklist violation
    #[error("contract list violation: {0}")]
    ContractList(String),

    /// Action blacklist violation
    #[error("action list violation: {0}")]
    ActionList(String),

    /// Contract table read or write outside what the action may touch
    #[error("table access violation: {0}")]
    TableAccess(String),

    /// Binary (de)serialization failure
    #[error("codec error: {0}")]
    Codec(String),

    /// Object store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Allocation failure, never captured into a trace
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Inner fault with an attached diagnostic line
    #[error("{source} ({message})")]
    Context { message: String, source: Box<Error> },
}

fn format_authority(account: &Name, permission: &Option<Name>) -> String {
    match permission {
        Some(permission) => format!("{}/{}", account, permission),
        None => account.to_string(),
    }
}

impl Error {
    pub fn missing_auth(account: Name) -> Self {
        Error::MissingAuth {
            account,
            permission: None,
        }
    }

    pub fn missing_permission(level: &PermissionLevel) -> Self {
        Error::MissingAuth {
            account: level.actor,
            permission: Some(level.permission),
        }
    }

    /// Build a subjective fault that keeps the diagnostic log of `original`
    pub fn subjective(message: impl Into<String>, original: &Error) -> Self {
        Error::SubjectiveBlockProduction {
            message: message.into(),
            log: original.log(),
        }
    }

    /// Attach a diagnostic line; fatal faults pass through untouched
    pub fn context(self, message: impl Into<String>) -> Self {
        if self.is_fatal() {
            return self;
        }
        Error::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// Unrecoverable faults bypass trace capture and unwind everything
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::OutOfMemory(_) => true,
            Error::Context { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Error code recorded into the action trace, if the fault carries one
    pub fn error_code(&self) -> Option<u64> {
        match self {
            Error::AssertCode { code, .. } => Some(*code),
            Error::Context { source, .. } => source.error_code(),
            _ => None,
        }
    }

    /// The classified fault underneath any context wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Flattened diagnostic log, innermost entry first
    pub fn log(&self) -> Vec<String> {
        match self {
            Error::Context { message, source } => {
                let mut log = source.log();
                log.push(message.clone());
                log
            }
            Error::SubjectiveBlockProduction { message, log } => {
                let mut entries = log.clone();
                entries.push(message.clone());
                entries
            }
            other => vec![other.to_string()],
        }
    }
}

/// Result type alias for execution core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_auth_display() {
        let alice: Name = "alice".parse().unwrap();
        assert_eq!(
            Error::missing_auth(alice).to_string(),
            "missing authority of alice"
        );
        let level = PermissionLevel::new(alice, "active".parse().unwrap());
        assert_eq!(
            Error::missing_permission(&level).to_string(),
            "missing authority of alice/active"
        );
    }

    #[test]
    fn test_context_preserves_root() {
        let err = Error::missing_auth("bob".parse().unwrap()).context("pending console output: hi");
        assert!(matches!(err.root(), Error::MissingAuth { .. }));
        assert_eq!(err.log().len(), 2);
        assert_eq!(err.log()[1], "pending console output: hi");
    }

    #[test]
    fn test_fatal_passes_through_context() {
        let err = Error::OutOfMemory("arena".into()).context("ignored");
        assert!(err.is_fatal());
        assert!(matches!(err, Error::OutOfMemory(_)));
    }

    #[test]
    fn test_subjective_keeps_original_log() {
        let original = Error::UnsatisfiedAuthorization("alice@active".into()).context("inner");
        let err = Error::subjective("Authorization failure with inline action sent to self", &original);
        let log = err.log();
        assert_eq!(log.len(), 3);
        assert!(log[0].contains("alice@active"));
        assert!(log[2].contains("sent to self"));
    }

    #[test]
    fn test_error_code_only_for_assertions() {
        let err = Error::AssertCode {
            code: 42,
            message: "boom".into(),
        }
        .context("wrapped");
        assert_eq!(err.error_code(), Some(42));
        assert_eq!(Error::DeadlineExceeded.error_code(), None);
    }
}
