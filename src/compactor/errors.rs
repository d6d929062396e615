//! Semantic error classes for compaction
//!
//! Concrete failures are classified into halt (correctness violation, never
//! retried), retry (transient, re-run from scratch), reparable (broken block
//! that the repair side channel can rebuild) and out-of-order chunks
//! (skippable when configured). Callers match on the class, never on message
//! strings.

use std::fmt;

use crate::block::BlockId;
use crate::Error;

pub type CompactResult<T> = std::result::Result<T, CompactError>;

#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    /// A correctness violation that retrying cannot fix. Surfaced
    /// immediately; the orchestrator never reschedules after one.
    #[error("{0}")]
    Halt(#[source] Error),
    /// Transient failure; re-invoking the pass retries from scratch.
    #[error("{0}")]
    Retry(#[source] Error),
    /// A block with chunks outside its declared range. Rebuildable by the
    /// repair side channel.
    #[error("reparable block {id}: {source}")]
    Reparable {
        id: BlockId,
        #[source]
        source: Error,
    },
    /// A block with out-of-order chunks; skippable via a no-compact marker
    /// when the orchestrator is configured to do so.
    #[error("block {id} with out-of-order chunks: {source}")]
    OutOfOrderChunks {
        id: BlockId,
        #[source]
        source: Error,
    },
    /// Unclassified failure; neither retried nor treated as a halt.
    #[error("{0}")]
    Other(#[source] Error),
    /// Aggregate of per-group failures from one pass.
    #[error("{0}")]
    Multiple(MultiError),
}

impl CompactError {
    pub fn halt(err: Error) -> Self {
        CompactError::Halt(err)
    }

    pub fn retry(err: Error) -> Self {
        CompactError::Retry(err)
    }

    /// True when this error, or any member of an aggregate, is a halt.
    pub fn is_halt(&self) -> bool {
        match self {
            CompactError::Halt(_) => true,
            CompactError::Multiple(m) => m.errors().iter().any(|e| e.is_halt()),
            _ => false,
        }
    }

    /// True when this error is retryable; an aggregate is retryable only if
    /// every member is.
    pub fn is_retry(&self) -> bool {
        match self {
            CompactError::Retry(_) => true,
            CompactError::Multiple(m) => {
                !m.errors().is_empty() && m.errors().iter().all(|e| e.is_retry())
            }
            _ => false,
        }
    }

    /// Wraps the message with context while preserving the semantic class.
    pub fn context(self, ctx: &str) -> CompactError {
        match self {
            CompactError::Halt(e) => CompactError::Halt(Error::Compaction(format!("{ctx}: {e}"))),
            CompactError::Retry(e) => CompactError::Retry(Error::Compaction(format!("{ctx}: {e}"))),
            CompactError::Reparable { id, source } => CompactError::Reparable {
                id,
                source: Error::Compaction(format!("{ctx}: {source}")),
            },
            CompactError::OutOfOrderChunks { id, source } => CompactError::OutOfOrderChunks {
                id,
                source: Error::Compaction(format!("{ctx}: {source}")),
            },
            CompactError::Other(e) => CompactError::Other(Error::Compaction(format!("{ctx}: {e}"))),
            CompactError::Multiple(m) => CompactError::Multiple(m),
        }
    }
}

/// Collects independent failures while preserving each member's class.
#[derive(Debug, Default)]
pub struct MultiError(Vec<CompactError>);

impl MultiError {
    pub fn new() -> Self {
        MultiError(Vec::new())
    }

    pub fn add(&mut self, err: CompactError) {
        self.0.push(err);
    }

    pub fn errors(&self) -> &[CompactError] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Ok when empty; a single member unwraps to itself; more become an
    /// aggregate.
    pub fn into_result(mut self) -> CompactResult<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(CompactError::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred: ", self.0.len())?;
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn halt() -> CompactError {
        CompactError::halt(Error::Compaction("bad overlap".to_string()))
    }

    fn retry() -> CompactError {
        CompactError::retry(Error::Compaction("flaky bucket".to_string()))
    }

    #[test]
    fn test_basic_classification() {
        assert!(halt().is_halt());
        assert!(!halt().is_retry());
        assert!(retry().is_retry());
        assert!(!retry().is_halt());

        let other = CompactError::Other(Error::Compaction("odd".to_string()));
        assert!(!other.is_halt());
        assert!(!other.is_retry());
    }

    #[test]
    fn test_multi_halts_if_any_member_halts() {
        let mut m = MultiError::new();
        m.add(retry());
        m.add(halt());
        let err = m.into_result().unwrap_err();
        assert!(err.is_halt());
        assert!(!err.is_retry());
    }

    #[test]
    fn test_multi_retries_only_if_all_members_retry() {
        let mut m = MultiError::new();
        m.add(retry());
        m.add(retry());
        let err = m.into_result().unwrap_err();
        assert!(err.is_retry());

        let mut m = MultiError::new();
        m.add(retry());
        m.add(CompactError::Other(Error::Compaction("odd".to_string())));
        let err = m.into_result().unwrap_err();
        assert!(!err.is_retry());
    }

    #[test]
    fn test_single_member_unwraps() {
        let mut m = MultiError::new();
        m.add(halt());
        let err = m.into_result().unwrap_err();
        assert!(matches!(err, CompactError::Halt(_)));
    }

    #[test]
    fn test_context_preserves_class_and_message() {
        let err = halt().context("group 0@{}");
        assert!(err.is_halt());
        assert!(err.to_string().contains("group 0@{}"));
        assert!(err.to_string().contains("bad overlap"));

        let id = crate::block::BlockId::new(1);
        let rep = CompactError::Reparable {
            id,
            source: Error::Compaction("outside chunks".to_string()),
        }
        .context("download");
        assert!(matches!(rep, CompactError::Reparable { .. }));
    }

    #[test]
    fn test_empty_multi_is_ok() {
        assert!(MultiError::new().into_result().is_ok());
    }
}
