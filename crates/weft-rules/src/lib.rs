pub mod engine;
pub mod error;
pub mod rule;

pub use engine::{FilterEngine, RuleMatch};
pub use error::RuleError;
pub use rule::{
    RequestDescriptor, ResourceType, Rule, RuleAction, RuleCondition, RuleSource,
};
