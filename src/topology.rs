//! The externally-authored package descriptor.
//!
//! The runtime consumes this only to learn its initial context topology:
//! which page patterns get page-bound contexts, and the coordinator entry
//! point. It neither validates nor generates descriptors, and unknown
//! fields are ignored.

use serde::{Deserialize, Serialize};
use weft_core::ContextDescriptor;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorDecl {
    pub entry: String,
}

/// A page pattern that gets a page-bound context injected.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageBinding {
    pub pattern: String,
    /// Explicit context id; derived from position when absent.
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSurfaceDecl {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub coordinator: CoordinatorDecl,
    #[serde(default)]
    pub pages: Vec<PageBinding>,
    #[serde(default)]
    pub ui: Vec<UiSurfaceDecl>,
}

impl PackageDescriptor {
    /// The contexts this descriptor declares, with the given coordinator id.
    pub fn initial_contexts(&self, coordinator_id: &str) -> Vec<ContextDescriptor> {
        let mut contexts = vec![ContextDescriptor::coordinator(coordinator_id)];
        for (i, page) in self.pages.iter().enumerate() {
            let id = page
                .context
                .clone()
                .unwrap_or_else(|| format!("page-{i}"));
            contexts.push(ContextDescriptor::page_bound(id, page.pattern.clone()));
        }
        for surface in &self.ui {
            contexts.push(ContextDescriptor::ui_surface(format!("ui-{}", surface.name)));
        }
        contexts
    }
}
