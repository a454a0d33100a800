//! Shared line-level parsers used by more than one extractor

pub mod clf;
pub mod freeze;

/// The first directory segment under /srv, if the path is rooted there.
///
/// Checkout directories live directly under /srv, so a log or document-root
/// path like `/srv/site.example.org/var/log/access.log` ties the site to the
/// checkout `site.example.org`.
pub fn srv_checkout(path: &str) -> Option<String> {
    let mut parts = path.split('/');
    parts.next()?; // Leading empty segment of an absolute path.
    if parts.next() != Some("srv") {
        return None;
    }
    match parts.next() {
        Some(segment) if !segment.is_empty() => Some(segment.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srv_checkout() {
        assert_eq!(
            srv_checkout("/srv/site.example.org/var/log/access.log").as_deref(),
            Some("site.example.org")
        );
        assert_eq!(srv_checkout("/var/log/nginx/access.log"), None);
        assert_eq!(srv_checkout("relative/path"), None);
        assert_eq!(srv_checkout("/srv/"), None);
    }
}
