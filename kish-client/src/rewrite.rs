//! Request header rewriting for the local target.
//!
//! Browsers reaching a tunnel send `Origin` and `Referer` values naming the
//! public URL. Local services that check them expect their own address, so
//! headers pointing at the public URL are rewritten to the target.

use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST, LOCATION, ORIGIN, REFERER};
use hyper::Request;
use kish_core::forward::RequestHook;
use kish_core::ForwardHooks;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct HeaderRewriter {
    public_url: String,
    target: String,
    host_header: Option<String>,
}

impl HeaderRewriter {
    pub fn new(public_url: &str, target: &str, host_header: Option<String>) -> Self {
        Self {
            public_url: public_url.to_string(),
            target: target.to_string(),
            host_header: host_header.filter(|h| !h.is_empty()),
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Some(host) = &self.host_header {
            set(headers, HOST, host);
        }

        for name in [LOCATION, REFERER] {
            let rewritten = headers
                .get(&name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| self.points_at_public_url(v))
                .map(|v| self.retarget(v));
            if let Some(value) = rewritten {
                set(headers, name, &value);
            }
        }

        let origin_matches = headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| self.points_at_public_url(v));
        if origin_matches {
            let origin = format!("http://{}", self.target);
            set(headers, ORIGIN, &origin);
        }
    }

    fn points_at_public_url(&self, value: &str) -> bool {
        !self.public_url.is_empty() && value.starts_with(&self.public_url)
    }

    /// Same path and query, with scheme `http` and the target as authority.
    fn retarget(&self, value: &str) -> String {
        let rest = value.split_once("://").map(|(_, rest)| rest).unwrap_or(value);
        let tail = rest.find(['/', '?', '#']).map(|i| &rest[i..]).unwrap_or("");
        format!("http://{}{}", self.target, tail)
    }

    /// Forwarding hooks applying this rewriter to every request.
    pub fn into_hooks(self) -> ForwardHooks {
        let hook: RequestHook = Arc::new(move |req: &mut Request<Incoming>| {
            self.apply(req.headers_mut());
            None
        });
        ForwardHooks {
            request: Some(hook),
            response: None,
        }
    }
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(_) => warn!("Not rewriting {}: invalid value {:?}", name, value),
    }
}
