use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use tether_core::role::{RoleCatalog, RoleDefinition, RoleError};

use crate::error::EngineError;

/// In-memory role catalog, optionally loaded from JSON.
///
/// Accepts either a list of role definitions or `{"roles": [...]}`.
#[derive(Clone, Debug, Default)]
pub struct StaticRoleCatalog {
    roles: HashMap<String, RoleDefinition>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RoleFile {
    List(Vec<RoleDefinition>),
    Wrapped { roles: Vec<RoleDefinition> },
}

impl StaticRoleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: RoleDefinition) -> Self {
        self.insert(role);
        self
    }

    pub fn insert(&mut self, role: RoleDefinition) {
        self.roles.insert(role.name.clone(), role);
    }

    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let file: RoleFile =
            serde_json::from_str(json).map_err(|e| EngineError::Config(format!("invalid role catalog: {e}")))?;
        let roles = match file {
            RoleFile::List(roles) | RoleFile::Wrapped { roles } => roles,
        };
        let mut catalog = Self::new();
        for role in roles {
            if role.name.trim().is_empty() {
                return Err(EngineError::Config("role with empty name".into()));
            }
            catalog.insert(role);
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.roles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl RoleCatalog for StaticRoleCatalog {
    fn get_role(&self, name: &str) -> Result<RoleDefinition, RoleError> {
        self.roles
            .get(name)
            .cloned()
            .ok_or_else(|| RoleError::NotFound(name.to_string()))
    }
}
