//! Identity substitution for bodies and response headers.
//!
//! The rewriters substitute one origin for another without any structural
//! understanding of the payload: body rewriting is literal byte-string
//! replacement, and header rewriting touches only `Location` and
//! `Set-Cookie`. Everything here operates on fully buffered data; framing
//! headers are stripped alongside the hop-by-hop set so the HTTP layer
//! recomputes `Content-Length` from the buffered bytes.

use bytes::Bytes;
use cookie::Cookie;
use http::header::{self, HeaderMap, HeaderValue};
use url::Url;

use crate::host::{compare_host, strip_port, HostConfig, Origin};

/// Hop-by-hop headers dropped in both directions, per standard
/// reverse-proxy semantics.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Replaces every non-overlapping occurrence of `from` in `data`,
/// left-to-right. Returns `None` when nothing matched so callers can keep
/// the original buffer.
pub fn replace_all(data: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    if from.is_empty() || data.len() < from.len() {
        return None;
    }

    let mut out: Vec<u8> = Vec::new();
    let mut matched = false;
    let mut rest = data;

    while let Some(pos) = rest.windows(from.len()).position(|w| w == from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(to);
        rest = &rest[pos + from.len()..];
        matched = true;
    }

    if !matched {
        return None;
    }
    out.extend_from_slice(rest);
    Some(out)
}

/// The exposed origin as it appears on the wire, including the path prefix.
fn exposed_with_prefix(exposed: &Origin, config: &HostConfig) -> String {
    match &config.path_prefix {
        Some(prefix) => format!("{exposed}{prefix}"),
        None => exposed.to_string(),
    }
}

/// Rewrites an outbound request body: occurrences of the exposed origin
/// (with path prefix) become the target origin.
pub fn rewrite_request_body(body: Bytes, exposed: &Origin, config: &HostConfig) -> Bytes {
    let from = exposed_with_prefix(exposed, config);
    let to = config.target_origin().to_string();
    if from == to {
        return body;
    }
    match replace_all(&body, from.as_bytes(), to.as_bytes()) {
        Some(rewritten) => Bytes::from(rewritten),
        None => body,
    }
}

/// Rewrites an inbound response body: occurrences of the target origin
/// become the exposed origin (with path prefix).
pub fn rewrite_response_body(body: Bytes, exposed: &Origin, config: &HostConfig) -> Bytes {
    let from = config.target_origin().to_string();
    let to = exposed_with_prefix(exposed, config);
    if from == to {
        return body;
    }
    match replace_all(&body, from.as_bytes(), to.as_bytes()) {
        Some(rewritten) => Bytes::from(rewritten),
        None => body,
    }
}

/// Rewrites a redirect `Location` whose origin equals the target origin.
///
/// Any other value passes through unchanged: other hosts (including the
/// upstream's), schemeless or path-only values, and values that fail to
/// parse.
pub fn rewrite_location(headers: &mut HeaderMap, exposed: &Origin, config: &HostConfig) {
    let Some(location) = headers.get(header::LOCATION) else {
        return;
    };
    let Ok(raw) = location.to_str() else {
        return;
    };
    let Ok(url) = Url::parse(raw) else {
        return;
    };
    let Some(host) = url.host_str() else {
        return;
    };

    let location_origin = Origin::new(
        url.scheme(),
        match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        },
    );
    if !location_origin.same_origin(&config.target_origin()) {
        return;
    }

    let mut rewritten = format!(
        "{}{}{}",
        exposed,
        config.path_prefix.as_deref().unwrap_or(""),
        url.path()
    );
    if let Some(query) = url.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        rewritten.push('#');
        rewritten.push_str(fragment);
    }

    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(header::LOCATION, value);
    }
}

/// Rewrites `Set-Cookie` headers.
///
/// A `Domain` matching the target host becomes the configured cookie domain
/// or is removed entirely. When the exposed scheme is not `https`, `Secure`
/// is cleared. Cookies needing neither change are forwarded byte-for-byte.
pub fn rewrite_set_cookie(headers: &mut HeaderMap, exposed: &Origin, config: &HostConfig) {
    let values: Vec<HeaderValue> = headers.get_all(header::SET_COOKIE).iter().cloned().collect();
    if values.is_empty() {
        return;
    }
    headers.remove(header::SET_COOKIE);

    let exposed_is_https = exposed.scheme.eq_ignore_ascii_case("https");
    for value in values {
        let rewritten = value
            .to_str()
            .ok()
            .and_then(|raw| rewrite_cookie(raw, exposed_is_https, config))
            .and_then(|cookie| HeaderValue::from_str(&cookie).ok());
        headers.append(header::SET_COOKIE, rewritten.unwrap_or(value));
    }
}

/// Rewrites a single cookie, returning `None` when it can pass through
/// unchanged (or cannot be parsed).
fn rewrite_cookie(raw: &str, exposed_is_https: bool, config: &HostConfig) -> Option<String> {
    let mut cookie = Cookie::parse(raw.to_owned()).ok()?;

    let domain_matches = cookie
        .domain()
        .map(|d| compare_host(d, strip_port(&config.target_host)))
        .unwrap_or(false);
    let downgrade_secure = !exposed_is_https && cookie.secure().unwrap_or(false);

    if !domain_matches && !downgrade_secure {
        return None;
    }

    if domain_matches {
        match &config.cookie_domain {
            Some(domain) => cookie.set_domain(domain.clone()),
            None => cookie = without_domain(&cookie),
        }
    }
    if downgrade_secure {
        cookie.set_secure(None::<bool>);
    }

    Some(cookie.to_string())
}

/// Rebuilds a cookie without its `Domain` attribute, carrying every other
/// attribute over.
fn without_domain(cookie: &Cookie<'_>) -> Cookie<'static> {
    let mut builder = Cookie::build((cookie.name().to_owned(), cookie.value().to_owned()));
    if let Some(path) = cookie.path() {
        builder = builder.path(path.to_owned());
    }
    if let Some(secure) = cookie.secure() {
        builder = builder.secure(secure);
    }
    if let Some(http_only) = cookie.http_only() {
        builder = builder.http_only(http_only);
    }
    if let Some(same_site) = cookie.same_site() {
        builder = builder.same_site(same_site);
    }
    if let Some(max_age) = cookie.max_age() {
        builder = builder.max_age(max_age);
    }
    if let Some(expires) = cookie.expires() {
        builder = builder.expires(expires);
    }
    builder.build()
}

/// Drops hop-by-hop headers, any header named in `Connection`, and the
/// framing headers that no longer describe the buffered body.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in named {
        headers.remove(name.as_str());
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
}
