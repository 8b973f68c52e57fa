//! Request matching derived from route blocks

use crate::models::resource::{PathMatch, RouteBlock};

/// Host and path predicate of one route block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatcher {
    /// Lower-cased hostname, `*.` prefix matches any subdomain
    hostname: String,
    path: String,
    mode: PathMatch,
}

/// Host of a request, from the URI authority or the Host header, without port
pub fn request_host<B>(req: &http::Request<B>) -> Option<String> {
    let host = match req.uri().host() {
        Some(host) => host.to_string(),
        None => {
            let header = req.headers().get(http::header::HOST)?.to_str().ok()?;
            header.to_string()
        }
    };
    let host = match host.rsplit_once(':') {
        // keep bracketed IPv6 literals whole
        Some((name, port)) if !name.is_empty() && !port.contains(']') => name.to_string(),
        _ => host,
    };
    Some(host.to_ascii_lowercase())
}

impl RouteMatcher {
    pub fn compile(block: &RouteBlock) -> Self {
        let path = if block.path.is_empty() {
            "/".to_string()
        } else if block.path.starts_with('/') {
            block.path.clone()
        } else {
            format!("/{}", block.path)
        };
        Self {
            hostname: block.hostname.trim().to_ascii_lowercase(),
            path,
            mode: block.path_match,
        }
    }

    fn host_matches(&self, host: &str) -> bool {
        match self.hostname.strip_prefix("*.") {
            Some(domain) => host
                .strip_suffix(domain)
                .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.')),
            None => self.hostname.is_empty() || self.hostname == host,
        }
    }

    fn path_matches(&self, path: &str) -> bool {
        match self.mode {
            PathMatch::Exact => path == self.path,
            PathMatch::Prefix => {
                if self.path == "/" {
                    return true;
                }
                let prefix = self.path.trim_end_matches('/');
                match path.strip_prefix(prefix) {
                    Some(rest) => rest.is_empty() || rest.starts_with('/'),
                    None => false,
                }
            }
        }
    }

    pub fn matches<B>(&self, req: &http::Request<B>) -> bool {
        let host_ok = match request_host(req) {
            Some(host) => self.host_matches(&host),
            None => self.hostname.is_empty(),
        };
        host_ok && self.path_matches(req.uri().path())
    }
}
