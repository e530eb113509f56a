//! Module descriptors - the immutable metadata of one deployable unit.
//!
//! Descriptors are produced once by a scanner (see [`crate::contracts::ModuleScanner`])
//! and never mutated by the runtime.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

/// Unique identity of a module within one running process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct ModuleIdentity {
    pub name: String,
    pub version: String,
}

impl ModuleIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Name of a capability a module can export or import.
///
/// Cheap to clone; compared and hashed by its string form.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(from = "String")]
pub struct CapabilityId(Arc<str>);

impl CapabilityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CapabilityId {
    fn from(s: String) -> Self {
        CapabilityId(Arc::from(s.as_str()))
    }
}

impl From<&str> for CapabilityId {
    fn from(s: &str) -> Self {
        CapabilityId(Arc::from(s))
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One capability a module declares it will publish when active.
#[derive(Clone, Debug, Deserialize)]
pub struct ExportSpec {
    pub capability: CapabilityId,
    /// Tie-break between multiple providers of the same capability;
    /// higher rank wins.
    #[serde(default)]
    pub rank: i32,
}

/// One capability a module needs (or can use) from the rest of the system.
#[derive(Clone, Debug, Deserialize)]
pub struct ImportSpec {
    pub capability: CapabilityId,
    /// Optional imports never block resolution.
    #[serde(default)]
    pub optional: bool,
}

/// Parsed metadata of one deployable unit.
///
/// `entry_point` names an activator registered through
/// [`crate::contracts::ActivatorEntry`]; it is the descriptor's reference to
/// the loadable unit.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: String,
    pub entry_point: String,
    #[serde(default)]
    pub exports: Vec<ExportSpec>,
    #[serde(default)]
    pub imports: Vec<ImportSpec>,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            entry_point: entry_point.into(),
            exports: Vec::new(),
            imports: Vec::new(),
        }
    }

    pub fn with_export(mut self, capability: impl Into<CapabilityId>, rank: i32) -> Self {
        self.exports.push(ExportSpec {
            capability: capability.into(),
            rank,
        });
        self
    }

    pub fn with_import(mut self, capability: impl Into<CapabilityId>, optional: bool) -> Self {
        self.imports.push(ImportSpec {
            capability: capability.into(),
            optional,
        });
        self
    }

    pub fn identity(&self) -> ModuleIdentity {
        ModuleIdentity::new(self.name.clone(), self.version.clone())
    }

    /// Declared export spec for `capability`, if any.
    pub fn export(&self, capability: &CapabilityId) -> Option<&ExportSpec> {
        self.exports.iter().find(|e| &e.capability == capability)
    }

    pub fn mandatory_imports(&self) -> impl Iterator<Item = &ImportSpec> {
        self.imports.iter().filter(|i| !i.optional)
    }
}
