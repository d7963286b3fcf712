use crate::engine::Refresh;

/// Write visibility per write path. Callers may still override it per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Single-record create/replace/patch/delete.
    pub single: Refresh,
    pub bulk: Refresh,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        RefreshPolicy {
            single: Refresh::WaitFor,
            bulk: Refresh::Eventual,
        }
    }
}

impl RefreshPolicy {
    pub fn for_single(&self, requested: Option<Refresh>) -> Refresh {
        requested.unwrap_or(self.single)
    }

    pub fn for_bulk(&self, requested: Option<Refresh>) -> Refresh {
        requested.unwrap_or(self.bulk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.for_single(None), Refresh::WaitFor);
        assert_eq!(policy.for_bulk(None), Refresh::Eventual);
        assert_eq!(policy.for_bulk(Some(Refresh::Immediate)), Refresh::Immediate);
    }

    #[test]
    fn test_parse_refresh() {
        assert_eq!(Refresh::parse("wait_for"), Some(Refresh::WaitFor));
        assert_eq!(Refresh::parse("TRUE"), Some(Refresh::Immediate));
        assert_eq!(Refresh::parse("eventual"), Some(Refresh::Eventual));
        assert_eq!(Refresh::parse("sometimes"), None);
    }
}
