use serde::{Deserialize, Serialize};

/// Tri-level validation state carried by every persisted object.
///
/// The levels are monotone within a single validation pass: `validated`
/// (structural checks), `useable` (cross-object constraints), and
/// `available` (on-disk dependencies present, renderers built). A level
/// is only set when no errors have accumulated up to that point, so a
/// failure short-circuits the later levels while leaving the earlier
/// ones intact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    #[serde(default)]
    pub validated: bool,
    #[serde(default)]
    pub useable: bool,
    #[serde(default)]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(skip)]
    pub force_change: bool,
}

impl Validation {
    /// Reset all levels and drop accumulated errors. Called at the start
    /// of every validation pass. `read_only` and `force_change` survive.
    pub fn clear(&mut self) {
        self.validated = false;
        self.useable = false;
        self.available = false;
        self.errors.clear();
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Mark structurally valid if nothing failed yet. Returns the level.
    pub fn set_valid(&mut self) -> bool {
        self.validated = self.validated || self.errors.is_empty();
        self.validated
    }

    pub fn set_useable(&mut self) -> bool {
        self.useable = self.useable || (self.validated && self.errors.is_empty());
        self.useable
    }

    pub fn set_available(&mut self) -> bool {
        self.available = self.available || (self.useable && self.errors.is_empty());
        self.available
    }

    pub fn force_change(&mut self) {
        self.force_change = true;
    }

    pub fn change_forced(&self) -> bool {
        self.force_change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_monotone() {
        let mut v = Validation::default();
        assert!(v.set_valid());
        assert!(v.set_useable());
        assert!(v.set_available());
        assert!(v.validated && v.useable && v.available);
    }

    #[test]
    fn error_blocks_later_levels() {
        let mut v = Validation::default();
        assert!(v.set_valid());
        assert!(v.set_useable());
        v.error("missing kernel");
        assert!(!v.set_available());
        assert!(v.validated);
        assert!(v.useable);
        assert!(!v.available);
    }

    #[test]
    fn clear_resets_everything() {
        let mut v = Validation::default();
        v.set_valid();
        v.error("boom");
        v.clear();
        assert!(!v.validated && !v.has_errors());
    }

    #[test]
    fn errors_not_serialized_when_empty() {
        let v = Validation::default();
        let json = serde_json::to_string(&v).unwrap();
        assert!(!json.contains("errors"));
    }
}
