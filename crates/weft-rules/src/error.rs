use crate::rule::RuleSource;

/// Rule submission errors. These are configuration errors: rejected
/// atomically (the prior rule set is unaffected) and never retried.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("invalid rule {id}: {reason}")]
    InvalidRule { id: u32, reason: String },

    // Field deliberately not named `source`: thiserror would chain it as
    // the error cause, and RuleSource is not an error.
    #[error("duplicate rule id {id} in {rule_source} source")]
    DuplicateId { rule_source: RuleSource, id: u32 },
}
