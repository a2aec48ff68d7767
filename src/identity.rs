//! Peer identity matching against a proxy's expected SPIFFE identity.
//!
//! Identities are opaque strings parsed as
//! SPIFFE URIs (`spiffe://trust-domain/ns/<namespace>/sa/<service-account>`);
//! a connection is acceptable if at least one identity's (namespace,
//! service-account) matches the proxy's expected pair, with empty expected
//! fields acting as wildcards. The default behavior is to
//! accept when identity checking is disabled rather than reject-by-default.

/// The (namespace, service-account) pair parsed out of a SPIFFE URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffeId {
    /// The Kubernetes-style namespace segment (`/ns/<namespace>/`).
    pub namespace: String,
    /// The Kubernetes-style service account segment (`/sa/<service-account>`).
    pub service_account: String,
}

/// Parses `spiffe://<trust-domain>/ns/<namespace>/sa/<service-account>`.
///
/// Returns `None` for anything that doesn't match that shape; other SPIFFE
/// paths (not Istio's `ns`/`sa` convention) are not identities this checker
/// can match against and are treated as non-matching, not as errors.
pub fn parse_spiffe(identity: &str) -> Option<SpiffeId> {
    let rest = identity.strip_prefix("spiffe://")?;
    let (_trust_domain, path) = rest.split_once('/')?;
    let mut segments = path.split('/');
    if segments.next()? != "ns" {
        return None;
    }
    let namespace = segments.next()?.to_string();
    if segments.next()? != "sa" {
        return None;
    }
    let service_account = segments.next()?.to_string();
    Some(SpiffeId {
        namespace,
        service_account,
    })
}

/// Checks whether a set of peer identities authorizes a proxy with the
/// given expected namespace/service-account.
pub trait IdentityChecker: Send + Sync + 'static {
    /// Returns `true` if `identities` authorizes a connection expecting
    /// `expected_namespace`/`expected_service_account` (either may be empty,
    /// acting as a wildcard for that field).
    fn authorized(
        &self,
        identities: &[String],
        expected_namespace: Option<&str>,
        expected_service_account: Option<&str>,
    ) -> bool;
}

/// The default checker: accepts on the first identity that parses as
/// SPIFFE and whose namespace/service-account match the expected values
/// (empty expected fields act as wildcards).
#[derive(Debug, Clone, Copy, Default)]
pub struct SpiffeIdentityChecker;

impl IdentityChecker for SpiffeIdentityChecker {
    fn authorized(
        &self,
        identities: &[String],
        expected_namespace: Option<&str>,
        expected_service_account: Option<&str>,
    ) -> bool {
        identities.iter().filter_map(|id| parse_spiffe(id)).any(|spiffe| {
            let namespace_ok = expected_namespace.map_or(true, |ns| ns.is_empty() || ns == spiffe.namespace);
            let sa_ok = expected_service_account
                .map_or(true, |sa| sa.is_empty() || sa == spiffe.service_account);
            namespace_ok && sa_ok
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_istio_style_spiffe() {
        let id = parse_spiffe("spiffe://cluster.local/ns/default/sa/bookinfo").unwrap();
        assert_eq!(id.namespace, "default");
        assert_eq!(id.service_account, "bookinfo");
    }

    #[test]
    fn rejects_non_spiffe() {
        assert!(parse_spiffe("not-a-uri").is_none());
        assert!(parse_spiffe("spiffe://cluster.local/other/path").is_none());
    }

    #[test]
    fn empty_expectations_are_wildcards() {
        let checker = SpiffeIdentityChecker;
        let ids = vec!["spiffe://cluster.local/ns/default/sa/bookinfo".to_string()];
        assert!(checker.authorized(&ids, None, None));
        assert!(checker.authorized(&ids, Some(""), Some("")));
        assert!(checker.authorized(&ids, Some("default"), Some("bookinfo")));
        assert!(!checker.authorized(&ids, Some("other"), None));
    }

    #[test]
    fn accepts_on_first_viable_match_among_several() {
        let checker = SpiffeIdentityChecker;
        let ids = vec![
            "spiffe://cluster.local/ns/wrong/sa/wrong".to_string(),
            "spiffe://cluster.local/ns/default/sa/bookinfo".to_string(),
        ];
        assert!(checker.authorized(&ids, Some("default"), Some("bookinfo")));
    }

    #[test]
    fn empty_identity_list_never_authorizes_a_required_check() {
        let checker = SpiffeIdentityChecker;
        assert!(!checker.authorized(&[], Some("default"), Some("bookinfo")));
    }
}
