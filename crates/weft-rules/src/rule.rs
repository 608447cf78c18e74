use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a rule came from. Sources are independently enabled and updated;
/// rule ids are unique within a source, not across sources.
#[derive(Clone, Copy, Debug, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Static,
    Dynamic,
    Session,
}

impl RuleSource {
    pub const ALL: [RuleSource; 3] = [RuleSource::Static, RuleSource::Dynamic, RuleSource::Session];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleSource {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown rule source: {other}")),
        }
    }
}

/// Resource class of an outbound request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Script,
    Stylesheet,
    Image,
    Font,
    Media,
    Xhr,
    WebSocket,
    Other,
}

/// What to do with a matching request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Block,
    Redirect { to: String },
    ModifyHeaders { set: Vec<(String, String)>, remove: Vec<String> },
}

impl RuleAction {
    /// Fixed action-class ordering used to break priority ties:
    /// block > redirect > modifyHeaders > allow.
    pub fn class_rank(&self) -> u8 {
        match self {
            Self::Block => 3,
            Self::Redirect { .. } => 2,
            Self::ModifyHeaders { .. } => 1,
            Self::Allow => 0,
        }
    }

    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Redirect { .. } => "redirect",
            Self::ModifyHeaders { .. } => "modify_headers",
            Self::Allow => "allow",
        }
    }
}

/// Match condition. Empty method / resource-type lists match anything.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Regex matched against the full request URL.
    pub url_pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<ResourceType>,
}

/// A declarative filter rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rule {
    pub id: u32,
    /// Higher numeric priority wins among matching rules.
    pub priority: i32,
    pub condition: RuleCondition,
    pub action: RuleAction,
}

impl Rule {
    pub fn new(id: u32, priority: i32, url_pattern: impl Into<String>, action: RuleAction) -> Self {
        Self {
            id,
            priority,
            condition: RuleCondition {
                url_pattern: url_pattern.into(),
                methods: Vec::new(),
                resource_types: Vec::new(),
            },
            action,
        }
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.condition.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_resource_types(mut self, types: &[ResourceType]) -> Self {
        self.condition.resource_types = types.to_vec();
        self
    }
}

/// An outbound request about to cross the coordinator boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: String,
    pub resource_type: ResourceType,
}

impl RequestDescriptor {
    pub fn new(url: impl Into<String>, method: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            resource_type,
        }
    }
}
