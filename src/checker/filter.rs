//! Instance allow/deny filter

use std::collections::HashSet;

/// Decides which instances this replica checks.
///
/// A non-empty whitelist wins: only listed instances pass and the
/// blacklist is ignored. Otherwise the blacklist excludes.
#[derive(Debug, Default)]
pub struct InstanceFilter {
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
}

impl InstanceFilter {
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Self {
        Self {
            whitelist: whitelist.iter().cloned().collect(),
            blacklist: blacklist.iter().cloned().collect(),
        }
    }

    /// True when the instance must be skipped.
    pub fn filter_out(&self, instance_id: &str) -> bool {
        if !self.whitelist.is_empty() {
            return !self.whitelist.contains(instance_id);
        }
        self.blacklist.contains(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_filter_passes_everything() {
        let filter = InstanceFilter::new(&[], &[]);
        assert!(!filter.filter_out("any"));
    }

    #[test]
    fn whitelist_overrides_blacklist() {
        let filter = InstanceFilter::new(&ids(&["a"]), &ids(&["a", "b"]));
        assert!(!filter.filter_out("a"));
        assert!(filter.filter_out("b"));
        assert!(filter.filter_out("c"));
    }

    #[test]
    fn blacklist_excludes_when_whitelist_empty() {
        let filter = InstanceFilter::new(&[], &ids(&["b"]));
        assert!(!filter.filter_out("a"));
        assert!(filter.filter_out("b"));
    }
}
