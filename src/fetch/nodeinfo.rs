//! Builders for the NodeInfo discovery document and the `nodeinfo/2.x`
//! payload itself, per spec.md §6: `GET /.well-known/nodeinfo` MUST point at
//! `nodeinfo/2.0` and `nodeinfo/2.1`, which in turn carry software name,
//! version, open-registrations, user-count, and `protocols = ["activitypub"]`.
//!
//! Mirrors [crate::fetch::webfinger]'s split: this crate builds the response
//! bodies, the embedding application wires the `.well-known` routes and
//! supplies the counts.

use serde::{Deserialize, Serialize};
use url::Url;

/// `GET /.well-known/nodeinfo` response: pointers to the versioned documents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfoDiscovery {
    /// One entry per supported NodeInfo schema version.
    pub links: Vec<NodeInfoDiscoveryLink>,
}

/// A single `.well-known/nodeinfo` link entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfoDiscoveryLink {
    /// The NodeInfo schema this link points at, e.g.
    /// `http://nodeinfo.diaspora.software/ns/schema/2.1`.
    pub rel: String,
    /// Where the actual `NodeInfo` document for that schema is served.
    pub href: Url,
}

/// Build the `.well-known/nodeinfo` discovery document, pointing at both
/// `/nodeinfo/2.0` and `/nodeinfo/2.1` served from `domain`.
pub fn build_nodeinfo_discovery(domain: &str) -> NodeInfoDiscovery {
    let entry = |version: &str| NodeInfoDiscoveryLink {
        rel: format!("http://nodeinfo.diaspora.software/ns/schema/{version}"),
        href: format!("https://{domain}/nodeinfo/{version}")
            .parse()
            .expect("domain produces a valid url"),
    };
    NodeInfoDiscovery {
        links: vec![entry("2.0"), entry("2.1")],
    }
}

/// Software identity reported in a [NodeInfo] document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfoSoftware {
    /// Canonical, lowercase software name.
    pub name: String,
    /// Running version string.
    pub version: String,
    /// Source repository, only present in schema 2.1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<Url>,
}

/// Aggregate usage counters, per the NodeInfo `usage` object.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct NodeInfoUsage {
    /// Total registered local users.
    pub users: NodeInfoUserCounts,
    /// Total local posts, if tracked.
    #[serde(rename = "localPosts")]
    pub local_posts: u64,
}

/// Breakdown of the `usage.users` object.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct NodeInfoUserCounts {
    /// All registered users.
    pub total: u64,
    /// Users active in the last 180 days.
    #[serde(rename = "activeHalfyear")]
    pub active_halfyear: u64,
    /// Users active in the last 30 days.
    #[serde(rename = "activeMonth")]
    pub active_month: u64,
}

/// `GET /nodeinfo/{2.0,2.1}` response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Schema version this document conforms to, `"2.0"` or `"2.1"`.
    pub version: String,
    /// This instance's software identity.
    pub software: NodeInfoSoftware,
    /// Federation protocols this instance speaks. Always includes `"activitypub"`.
    pub protocols: Vec<String>,
    /// Usage counters.
    pub usage: NodeInfoUsage,
    /// Whether new accounts can register without an invite.
    #[serde(rename = "openRegistrations")]
    pub open_registrations: bool,
    /// Free-form extra metadata, software-specific.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Build a [NodeInfo] document for `version` (`"2.0"` or `"2.1"`). The
/// `repository` field is only emitted for `"2.1"`, per the schema difference
/// between the two versions.
#[allow(clippy::too_many_arguments)]
pub fn build_nodeinfo(
    version: &str,
    software_name: &str,
    software_version: &str,
    repository: Option<Url>,
    open_registrations: bool,
    usage: NodeInfoUsage,
) -> NodeInfo {
    let repository = if version == "2.1" { repository } else { None };
    NodeInfo {
        version: version.to_string(),
        software: NodeInfoSoftware {
            name: software_name.to_string(),
            version: software_version.to_string(),
            repository,
        },
        protocols: vec!["activitypub".to_string()],
        usage,
        open_registrations,
        metadata: serde_json::Value::Object(Default::default()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn discovery_points_at_both_schema_versions() {
        let discovery = build_nodeinfo_discovery("example.com");
        assert_eq!(discovery.links.len(), 2);
        assert_eq!(
            discovery.links[0].href.as_str(),
            "https://example.com/nodeinfo/2.0"
        );
        assert_eq!(
            discovery.links[1].href.as_str(),
            "https://example.com/nodeinfo/2.1"
        );
    }

    #[test]
    fn repository_only_emitted_for_2_1() {
        let repo: Url = "https://git.example.com/instance".parse().unwrap();
        let v20 = build_nodeinfo("2.0", "myapp", "1.0.0", Some(repo.clone()), true, NodeInfoUsage::default());
        let v21 = build_nodeinfo("2.1", "myapp", "1.0.0", Some(repo), true, NodeInfoUsage::default());
        assert!(v20.software.repository.is_none());
        assert!(v21.software.repository.is_some());
        assert_eq!(v21.protocols, vec!["activitypub".to_string()]);
    }
}
