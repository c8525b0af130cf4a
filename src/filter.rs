//! The rule-list matcher that decides whether a `(destination, path,
//! interface)` triple is "on the list" the proxy gates through consent.

/// One named list of literal-or-wildcard patterns.
#[derive(Debug, Clone, Default)]
struct RuleList {
    rules: Vec<String>,
}

impl RuleList {
    fn add(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if !self.rules.contains(&pattern) {
            self.rules.push(pattern);
        }
    }

    fn matches(&self, value: &str) -> bool {
        self.rules.iter().any(|rule| rule_matches(rule, value))
    }
}

/// A rule ending in `*`, `+` or `?` is a wildcard: it matches any value that
/// *contains* the rule with the trailing marker stripped. Anything else is
/// matched by exact equality.
fn rule_matches(rule: &str, value: &str) -> bool {
    match rule.strip_suffix(['*', '+', '?']) {
        Some(prefix) => value.contains(prefix),
        None => rule == value,
    }
}

/// Three independent rule lists keyed by `name` (destination), `path`, and
/// `interface`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    name: RuleList,
    path: RuleList,
    interface: RuleList,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_name(&mut self, pattern: impl Into<String>) {
        self.name.add(pattern);
    }

    pub fn add_path(&mut self, pattern: impl Into<String>) {
        self.path.add(pattern);
    }

    pub fn add_interface(&mut self, pattern: impl Into<String>) {
        self.interface.add(pattern);
    }

    /// Seed this filter with comma-separated lists, as the CLI surface
    /// accepts them. Empty segments are dropped.
    pub fn extend_names_csv(&mut self, csv: &str) {
        for item in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.add_name(item);
        }
    }

    pub fn extend_paths_csv(&mut self, csv: &str) {
        for item in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.add_path(item);
        }
    }

    pub fn extend_interfaces_csv(&mut self, csv: &str) {
        for item in csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.add_interface(item);
        }
    }

    /// `true` iff this triple is "on the list": at least one field is
    /// non-empty, and every non-empty field matches its rule list. An empty
    /// field trivially matches (the corresponding list is not consulted) —
    /// this is load-bearing for signals, which frequently carry no
    /// destination.
    pub fn is_message_match(&self, destination: &str, path: &str, interface: &str) -> bool {
        if destination.is_empty() && path.is_empty() && interface.is_empty() {
            return false;
        }

        (destination.is_empty() || self.name.matches(destination))
            && (path.is_empty() || self.path.matches(path))
            && (interface.is_empty() || self.interface.matches(interface))
    }

    /// The default rule set the proxy seeds before any user-configured
    /// rules: desktop portals and the bus daemon itself are always gated
    /// through the same consent path as everything else.
    pub fn with_default_rules() -> Self {
        let mut filter = Self::new();
        filter.add_name("org.freedesktop.portal.*");
        filter.add_path("/org/freedesktop/portal/*");
        filter.add_interface("org.freedesktop.portal.");
        filter.add_name("org.freedesktop.DBus");
        filter.add_path("/");
        filter.add_path("/org/freedesktop/DBus");
        filter.add_interface("org.freedesktop.DBus");
        filter
    }

    /// The current rule set as the `{"dbuspermission": {name, path,
    /// interface}}` document the proxy logs once at startup.
    pub fn dump_config(&self) -> serde_json::Value {
        serde_json::json!({
            "dbuspermission": {
                "name": self.name.rules,
                "path": self.path.rules,
                "interface": self.interface.rules,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_name_and_path_match() {
        let mut filter = Filter::new();
        filter.add_name("com.deepin.linglong.*");
        filter.add_path("/com/deepin/linglong/*");

        assert!(filter.is_message_match(
            "com.deepin.linglong.AppManager",
            "/com/deepin/linglong/PackageManager",
            ""
        ));

        assert!(!filter.is_message_match("com.deepin.test.AppManager", "/com/deepin/test", ""));
    }

    #[test]
    fn empty_triple_never_matches() {
        let filter = Filter::with_default_rules();
        assert!(!filter.is_message_match("", "", ""));
    }

    #[test]
    fn empty_field_is_trivially_satisfied() {
        let mut filter = Filter::new();
        filter.add_name("org.freedesktop.DBus");
        // No destination on this signal, but name list would otherwise reject it.
        assert!(filter.is_message_match("", "/org/freedesktop/DBus", ""));
    }

    #[test]
    fn duplicate_insertion_is_idempotent() {
        let mut filter = Filter::new();
        filter.add_name("org.freedesktop.DBus");
        filter.add_name("org.freedesktop.DBus");
        assert_eq!(filter.name.rules.len(), 1);
    }

    #[test]
    fn default_rules_cover_portals_and_bus() {
        let filter = Filter::with_default_rules();
        assert!(filter.is_message_match("org.freedesktop.portal.Documents", "/org/freedesktop/portal/desktop", ""));
        assert!(filter.is_message_match("org.freedesktop.DBus", "/org/freedesktop/DBus", "org.freedesktop.DBus"));
    }
}
