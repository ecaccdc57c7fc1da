use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of "the same task asked again": sha256 over role, task
/// and context, each length-prefixed so field boundaries can't collide.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskFingerprint(String);

impl TaskFingerprint {
    pub fn compute(task: &str, context: &str, role: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [role, task, context] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for file names and log fields.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for TaskFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_for_same_input() {
        let a = TaskFingerprint::compute("Analyze X", "ctx", "architect");
        let b = TaskFingerprint::compute("Analyze X", "ctx", "architect");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn differs_by_role_and_boundary() {
        let a = TaskFingerprint::compute("task", "ctx", "architect");
        let b = TaskFingerprint::compute("task", "ctx", "reviewer");
        assert_ne!(a, b);

        let c = TaskFingerprint::compute("ab", "c", "r");
        let d = TaskFingerprint::compute("a", "bc", "r");
        assert_ne!(c, d);
    }

    #[test]
    fn short_prefix() {
        let fp = TaskFingerprint::compute("t", "c", "r");
        assert_eq!(fp.short().len(), 12);
        assert!(fp.as_str().starts_with(fp.short()));
    }
}
