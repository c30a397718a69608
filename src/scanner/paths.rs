//! Probe URL construction. The base URL's escaped path must survive
//! byte-for-byte, so the join works on the already-encoded strings and never
//! re-escapes.

use url::{Position, Url};

pub fn join_path(base_path: &str, add: &str) -> String {
    if base_path.is_empty() || base_path == "/" {
        if add.starts_with('/') {
            return add.to_string();
        }
        return format!("/{add}");
    }
    let base = base_path.trim_end_matches('/');
    if add.starts_with('/') {
        format!("{base}{add}")
    } else {
        format!("{base}/{add}")
    }
}

/// Scheme + authority of the base joined with the raw path entry. The base's
/// query string is dropped.
pub fn build_raw_url(base: &Url, raw_path: &str) -> String {
    let mut path = join_path(base.path(), raw_path);
    if path.is_empty() {
        path = "/".to_string();
    }
    format!("{}{}", &base[..Position::BeforePath], path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_onto_root() {
        assert_eq!(join_path("/", "/admin"), "/admin");
        assert_eq!(join_path("/", "admin"), "/admin");
        assert_eq!(join_path("", "admin"), "/admin");
    }

    #[test]
    fn join_onto_subpath_strips_trailing_slash() {
        assert_eq!(join_path("/app/", "/admin"), "/app/admin");
        assert_eq!(join_path("/app", "admin"), "/app/admin");
        assert_eq!(join_path("/app//", "/x"), "/app/x");
    }

    #[test]
    fn raw_url_keeps_scheme_host_and_port() {
        let base = Url::parse("https://example.com:8443/app").unwrap();
        assert_eq!(build_raw_url(&base, "/login"), "https://example.com:8443/app/login");
    }

    #[test]
    fn raw_url_preserves_percent_encoding() {
        let base = Url::parse("http://h/a%20b/").unwrap();
        assert_eq!(build_raw_url(&base, "/x"), "http://h/a%20b/x");
    }

    #[test]
    fn raw_url_drops_base_query() {
        let base = Url::parse("http://h/p?debug=1").unwrap();
        assert_eq!(build_raw_url(&base, "/x"), "http://h/p/x");
    }

    #[test]
    fn raw_url_keeps_userinfo() {
        let base = Url::parse("http://user:pw@h/").unwrap();
        assert_eq!(build_raw_url(&base, "/x"), "http://user:pw@h/x");
    }
}
