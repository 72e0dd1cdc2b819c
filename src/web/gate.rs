//! Routing rules of the proxy gate
//!
//! Pure functions: which paths are served locally, whether a request is admitted, where it
//! is forwarded to, and which headers survive the hop.

use crate::supervisor::RouteSnapshot;

/// Sub-paths under the mount that the gate serves itself
const INTERNAL_SUBPATHS: &[&str] = &["/gate", "/opencode/directory", "/openchamber", "/terminal"];

/// Connection-scoped headers that must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// What the gate does with a request under the mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Forward,
    /// 503 with `restarting: true`
    Restarting,
    /// 503 with `restarting: false`; the backend was stopped on purpose
    Stopped,
}

/// Path below the mount, or `None` when the path is outside it
///
/// `"/api"` and `"/api/"` both map to `""`; `"/apix"` is outside `"/api"`.
pub fn strip_mount<'a>(path: &'a str, mount: &str) -> Option<&'a str> {
    let mount = mount.trim_end_matches('/');
    let rest = path.strip_prefix(mount)?;
    if rest.is_empty() || rest == "/" {
        Some("")
    } else if rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Target path on the backend: API prefix followed by the path below the mount
pub fn rewrite_path(rest: &str, prefix: &str) -> String {
    let joined = format!("{}{}", prefix, rest);
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

/// Paths the gate answers itself and never gates
pub fn is_bypass_path(path: &str, mount: &str) -> bool {
    if path == "/health" {
        return true;
    }
    match strip_mount(path, mount) {
        Some(rest) => INTERNAL_SUBPATHS.iter().any(|internal| {
            rest == *internal
                || rest
                    .strip_prefix(internal)
                    .map_or(false, |tail| tail.starts_with('/'))
        }),
        None => false,
    }
}

/// Decide whether a forwarded request may go through right now
pub fn admit(route: &RouteSnapshot, path: &str, mount: &str) -> Admission {
    if is_bypass_path(path, mount) {
        return Admission::Forward;
    }
    if route.stopped {
        return Admission::Stopped;
    }
    if route.gated {
        return Admission::Restarting;
    }
    Admission::Forward
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// `Accept: text/event-stream` requests are relayed as event streams
pub fn wants_event_stream(accept: Option<&str>) -> bool {
    accept.map_or(false, |value| value.to_ascii_lowercase().contains("text/event-stream"))
}

/// Full target URL on the backend
pub fn target_url(authority: &str, path: &str, query: &str, scheme: &str) -> String {
    if query.is_empty() {
        format!("{}://{}{}", scheme, authority, path)
    } else {
        format!("{}://{}{}?{}", scheme, authority, path, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ApiPrefix;

    fn route(gated: bool, stopped: bool) -> RouteSnapshot {
        RouteSnapshot {
            gated,
            restarting: gated,
            stopped,
            authority: "127.0.0.1:4096".to_string(),
            prefix: ApiPrefix::Detected(String::new()),
            generation: 1,
        }
    }

    #[test]
    fn test_strip_mount() {
        assert_eq!(strip_mount("/api/session", "/api"), Some("/session"));
        assert_eq!(strip_mount("/api", "/api"), Some(""));
        assert_eq!(strip_mount("/api/", "/api"), Some(""));
        assert_eq!(strip_mount("/apix/session", "/api"), None);
        assert_eq!(strip_mount("/other", "/api"), None);
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("/session", ""), "/session");
        assert_eq!(rewrite_path("/session", "/api"), "/api/session");
        assert_eq!(rewrite_path("", "/opencode"), "/opencode");
        assert_eq!(rewrite_path("", ""), "/");
    }

    #[test]
    fn test_bypass_paths() {
        assert!(is_bypass_path("/health", "/api"));
        assert!(is_bypass_path("/api/gate/status", "/api"));
        assert!(is_bypass_path("/api/opencode/directory", "/api"));
        assert!(is_bypass_path("/api/openchamber/models-metadata", "/api"));
        assert!(is_bypass_path("/api/terminal/abc/stream", "/api"));
        assert!(!is_bypass_path("/api/gateway", "/api"));
        assert!(!is_bypass_path("/api/session", "/api"));
        assert!(!is_bypass_path("/api/opencode/session", "/api"));
    }

    #[test]
    fn test_admission() {
        assert_eq!(admit(&route(true, false), "/api/session", "/api"), Admission::Restarting);
        assert_eq!(admit(&route(false, false), "/api/session", "/api"), Admission::Forward);
        assert_eq!(admit(&route(true, true), "/api/session", "/api"), Admission::Stopped);
        assert_eq!(admit(&route(true, false), "/api/gate/status", "/api"), Admission::Forward);
    }

    #[test]
    fn test_headers() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(wants_event_stream(Some("text/event-stream")));
        assert!(wants_event_stream(Some("application/json, Text/Event-Stream")));
        assert!(!wants_event_stream(None));
    }

    #[test]
    fn test_target_url() {
        assert_eq!(
            target_url("127.0.0.1:4096", "/session", "a=1", "http"),
            "http://127.0.0.1:4096/session?a=1"
        );
        assert_eq!(target_url("127.0.0.1:1", "/", "", "ws"), "ws://127.0.0.1:1/");
    }
}
