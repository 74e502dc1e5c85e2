//! Capability records and the per-kind route map model.

use manifold_wire::types::{Prompt, PromptArgument, Resource, Tool};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 3] = [Self::Tool, Self::Resource, Self::Prompt];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tool" | "tools" => Some(Self::Tool),
            "resource" | "resources" => Some(Self::Resource),
            "prompt" | "prompts" => Some(Self::Prompt),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific metadata carried alongside a capability record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityDetail {
    Tool {
        input_schema: Value,
    },
    Resource {
        uri: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Prompt {
        arguments: Vec<PromptArgument>,
    },
}

/// One capability as fetched from a backend, before filtering and renaming.
#[derive(Debug, Clone)]
pub struct RawCapability {
    pub name: String,
    pub description: Option<String>,
    pub kind: CapabilityKind,
    pub detail: CapabilityDetail,
}

impl RawCapability {
    pub fn from_tool(t: Tool) -> Self {
        Self {
            name: t.name,
            description: t.description,
            kind: CapabilityKind::Tool,
            detail: CapabilityDetail::Tool {
                input_schema: t.input_schema,
            },
        }
    }

    pub fn from_resource(r: Resource) -> Self {
        Self {
            name: r.name,
            description: r.description,
            kind: CapabilityKind::Resource,
            detail: CapabilityDetail::Resource {
                uri: r.uri,
                mime_type: r.mime_type,
            },
        }
    }

    pub fn from_prompt(p: Prompt) -> Self {
        Self {
            name: p.name,
            description: p.description,
            kind: CapabilityKind::Prompt,
            detail: CapabilityDetail::Prompt {
                arguments: p.arguments,
            },
        }
    }
}

/// A capability after filter/rename/conflict resolution, as published in the
/// registry catalog.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRecord {
    /// Name upstream clients see.
    pub exposed_name: String,
    /// Name the backend knows this capability by.
    pub original_name: String,
    pub kind: CapabilityKind,
    pub backend: String,
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub detail: CapabilityDetail,
}

/// Route map value: exposed name to dispatch target, one map per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub backend: String,
    pub original_name: String,
}
