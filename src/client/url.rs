//! URL plumbing for the redirector protocol.
//!
//! The redirector is steered away from already-used or failed replicas via an
//! opaque `tried=` query parameter listing server names. Server names are the
//! host portion of a source id, i.e. the substring before the first `:`.

/// Returns the server name of a source id (`host:port` or a bare host).
pub fn server_name(id: &str) -> &str {
    match id.find(':') {
        Some(pos) => &id[..pos],
        None => id,
    }
}

/// Joins an opaque parameter onto `url` with `?` or `&` as appropriate.
///
/// An empty opaque string leaves the URL untouched, so no dangling separator
/// is ever produced.
pub fn append_opaque(url: &str, opaque: &str) -> String {
    if opaque.is_empty() {
        url.to_string()
    } else if url.contains('?') {
        format!("{}&{}", url, opaque)
    } else {
        format!("{}?{}", url, opaque)
    }
}

/// Returns true if the URL's query string carries the named parameter.
pub fn has_param(url: &str, key: &str) -> bool {
    let query = match url.split_once('?') {
        Some((_, query)) => query,
        None => return false,
    };
    query
        .split('&')
        .any(|pair| pair.split('=').next() == Some(key))
}

/// Builds the `tried=` exclusion parameter from source ids.
///
/// Ids are reduced to their server names and comma-joined without a trailing
/// comma; no ids yields an empty string.
pub fn tried_param<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
    let joined = ids
        .into_iter()
        .map(server_name)
        .collect::<Vec<_>>()
        .join(",");
    if joined.is_empty() {
        joined
    } else {
        format!("tried={}", joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_strips_port() {
        assert_eq!(server_name("host1.example.org:1094"), "host1.example.org");
        assert_eq!(server_name("host1.example.org"), "host1.example.org");
        assert_eq!(server_name(""), "");
    }

    #[test]
    fn test_append_opaque_uses_question_mark_for_bare_url() {
        assert_eq!(
            append_opaque("root://redir.example/store/file.dat", "tried=a,b"),
            "root://redir.example/store/file.dat?tried=a,b"
        );
    }

    #[test]
    fn test_append_opaque_uses_ampersand_when_query_present() {
        assert_eq!(
            append_opaque("root://redir.example/f?svcClass=t0", "tried=a"),
            "root://redir.example/f?svcClass=t0&tried=a"
        );
    }

    #[test]
    fn test_append_opaque_empty_leaves_url_untouched() {
        assert_eq!(append_opaque("root://redir.example/f", ""), "root://redir.example/f");
    }

    #[test]
    fn test_has_param() {
        assert!(has_param("root://srv/f?org.dcache.uuid=1234&x=y", "org.dcache.uuid"));
        assert!(has_param("root://srv/f?x=y&org.dcache.uuid=1234", "org.dcache.uuid"));
        assert!(!has_param("root://srv/f?x=y", "org.dcache.uuid"));
        assert!(!has_param("root://srv/f", "org.dcache.uuid"));
    }

    #[test]
    fn test_tried_param_joins_server_names() {
        let ids = ["host1:1094", "host2:1094", "host3"];
        assert_eq!(
            tried_param(ids.iter().copied()),
            "tried=host1,host2,host3"
        );
    }

    #[test]
    fn test_tried_param_empty() {
        assert_eq!(tried_param(std::iter::empty()), "");
    }
}
