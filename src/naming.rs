//! Resource naming
//!
//! Machines and containers created by Armada are named `{group}-{seq}`.
//! Parsing a live name back into its group and sequence is the only way
//! group membership survives a restart, so [`ResourceName::parse`] must
//! accept everything [`ResourceName::format`] produces.

use std::fmt;

/// Separator between group and sequence
pub const SEQ_SEPARATOR: char = '-';

/// A `{group}-{seq}` resource name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    /// Group the resource belongs to
    pub group: String,
    /// Sequence number within the group
    pub seq: u64,
}

impl ResourceName {
    /// Create a new resource name
    pub fn new(group: &str, seq: u64) -> Self {
        Self {
            group: group.to_string(),
            seq,
        }
    }

    /// Render as `{group}-{seq}`
    pub fn format(&self) -> String {
        format!("{}{}{}", self.group, SEQ_SEPARATOR, self.seq)
    }

    /// Parse a live resource name.
    ///
    /// Accepts the bare form `web-3` as well as the `/node/web-3` and
    /// `/web-3` forms a swarm endpoint reports.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.strip_prefix('/').unwrap_or(name);
        let name = match name.rfind('/') {
            Some(idx) => &name[idx + 1..],
            None => name,
        };

        let idx = name.rfind(SEQ_SEPARATOR)?;
        if idx == 0 {
            return None;
        }

        let (group, seq) = (&name[..idx], &name[idx + 1..]);
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            group: group.to_string(),
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// Split a swarm-style `/node/name` into its node and bare name
pub fn split_node(name: &str) -> (Option<&str>, &str) {
    let name = name.strip_prefix('/').unwrap_or(name);
    match name.rfind('/') {
        Some(idx) if idx > 0 => (Some(&name[..idx]), &name[idx + 1..]),
        Some(idx) => (None, &name[idx + 1..]),
        None => (None, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(ResourceName::new("web", 3).format(), "web-3");
    }

    #[test]
    fn test_parse_bare() {
        let name = ResourceName::parse("cache-12").unwrap();
        assert_eq!(name.group, "cache");
        assert_eq!(name.seq, 12);
    }

    #[test]
    fn test_parse_group_with_dashes() {
        let name = ResourceName::parse("user-api-8080-4").unwrap();
        assert_eq!(name.group, "user-api-8080");
        assert_eq!(name.seq, 4);
    }

    #[test]
    fn test_parse_swarm_forms() {
        assert_eq!(
            ResourceName::parse("/node-1/web-2"),
            Some(ResourceName::new("web", 2))
        );
        assert_eq!(ResourceName::parse("/web-2"), Some(ResourceName::new("web", 2)));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert_eq!(ResourceName::parse("web"), None);
        assert_eq!(ResourceName::parse("-3"), None);
        assert_eq!(ResourceName::parse("web-"), None);
        assert_eq!(ResourceName::parse("web-x1"), None);
        assert_eq!(ResourceName::parse("web--1"), Some(ResourceName::new("web-", 1)));
    }

    #[test]
    fn test_round_trip() {
        for (group, seq) in [("web", 1), ("a-b-c", 42), ("consul-server", 0), ("x", u64::MAX)] {
            let name = ResourceName::new(group, seq);
            assert_eq!(ResourceName::parse(&name.format()), Some(name));
        }
    }

    #[test]
    fn test_split_node() {
        assert_eq!(split_node("/node-1/web-2"), (Some("node-1"), "web-2"));
        assert_eq!(split_node("/web-2"), (None, "web-2"));
        assert_eq!(split_node("web-2"), (None, "web-2"));
    }
}
