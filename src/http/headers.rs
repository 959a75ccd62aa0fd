//! Header manipulation shared by both proxy paths.
//!
//! # Responsibilities
//! - Keep headers as an ordered list so duplicate names survive forwarding
//! - Strip hop-by-hop headers in both directions
//! - Extend or synthesize `X-Forwarded-For` and `Via`
//!
//! # Design Decisions
//! - Names are matched case-insensitively but stored as received
//! - Repeated `X-Forwarded-For`/`Via` lines are folded into the first one so
//!   each appears exactly once on the way out
//! - Lists built from a hyper `HeaderMap` keep the order of values within a
//!   name, but values are grouped by name (`a, x, a` arrives as `a, a, x`)

use http::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderName, InvalidHeaderValue};

/// RFC 7230 §6.1 hop-by-hop headers plus the legacy `Keep-Alive`/`Trailers`.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const VIA: &str = "Via";

/// Exact, case-insensitive match against [`HOP_BY_HOP`].
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Token this proxy appends to `Via`.
pub fn via_token(hostname: &str) -> String {
    format!(
        "1.1 {} ({}/{})",
        hostname,
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

/// Ordered header multimap with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        map.iter()
            .map(|(name, value)| (name.as_str().to_string(), value.clone()))
            .collect()
    }

    /// Build a `HeaderMap`, appending so every duplicate is kept in order.
    pub fn to_header_map(&self) -> Result<HeaderMap, InvalidHeaderName> {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            map.append(name, value.clone());
        }
        Ok(map)
    }

    pub fn push(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.entries.push((name.into(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Every value for `name`, in the order received.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First value for `name` as text, if it is visible ASCII.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    fn append_to(&mut self, index: usize, addition: &HeaderValue) {
        let (_, current) = &mut self.entries[index];
        if let Ok(joined) = join_values(current, addition) {
            *current = joined;
        }
    }
}

impl FromIterator<(String, HeaderValue)> for HeaderList {
    fn from_iter<T: IntoIterator<Item = (String, HeaderValue)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn join_values(first: &HeaderValue, second: &HeaderValue) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut bytes = Vec::with_capacity(first.len() + 2 + second.len());
    bytes.extend_from_slice(first.as_bytes());
    bytes.extend_from_slice(b", ");
    bytes.extend_from_slice(second.as_bytes());
    HeaderValue::from_bytes(&bytes)
}

/// One forwarding pass over a header list.
///
/// `peer` is the address the message was received from (the client for
/// requests, the origin for responses); `via` is this proxy's token.
#[derive(Debug, Clone)]
pub struct HeaderTransform {
    peer: HeaderValue,
    via: HeaderValue,
}

impl HeaderTransform {
    pub fn new(peer: &str, via: &str) -> Result<Self, InvalidHeaderValue> {
        Ok(Self {
            peer: HeaderValue::from_str(peer)?,
            via: HeaderValue::from_str(via)?,
        })
    }

    pub fn apply(&self, incoming: &HeaderList) -> HeaderList {
        let mut out = HeaderList::new();
        let mut forwarded_for = None;
        let mut via = None;

        for (name, value) in incoming.iter() {
            if is_hop_by_hop(name) {
                continue;
            }
            let slot = if name.eq_ignore_ascii_case(X_FORWARDED_FOR) {
                &mut forwarded_for
            } else if name.eq_ignore_ascii_case(VIA) {
                &mut via
            } else {
                out.push(name, value.clone());
                continue;
            };
            match *slot {
                Some(index) => out.append_to(index, value),
                None => {
                    *slot = Some(out.len());
                    out.push(name, value.clone());
                }
            }
        }

        match forwarded_for {
            Some(index) => out.append_to(index, &self.peer),
            None => out.push(X_FORWARDED_FOR, self.peer.clone()),
        }
        match via {
            Some(index) => out.append_to(index, &self.via),
            None => out.push(VIA, self.via.clone()),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(pairs: &[(&str, &str)]) -> HeaderList {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), HeaderValue::from_str(v).unwrap()))
            .collect()
    }

    fn values<'a>(headers: &'a HeaderList, name: &'a str) -> Vec<&'a str> {
        headers.get_all(name).map(|v| v.to_str().unwrap()).collect()
    }

    fn transform() -> HeaderTransform {
        HeaderTransform::new("10.0.0.7", "1.1 box (media-tap/0.1.0)").unwrap()
    }

    #[test]
    fn duplicate_set_cookie_preserved_in_order() {
        let incoming = list(&[
            ("Set-Cookie", "a=1"),
            ("Content-Type", "text/html"),
            ("Set-Cookie", "b=2"),
        ]);
        let out = transform().apply(&incoming);
        assert_eq!(values(&out, "set-cookie"), vec!["a=1", "b=2"]);

        let map = out.to_header_map().unwrap();
        let cookies: Vec<_> = map.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn lookup_result_outlives_the_queried_name() {
        let headers = list(&[("Content-Type", "audio/mpeg"), ("content-type", "ignored")]);
        let found = {
            let name = String::from("CONTENT-TYPE");
            headers.get_str(&name)
        };
        assert_eq!(found, Some("audio/mpeg"));
        assert!(headers.contains("content-type"));
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn map_conversion_groups_values_by_name() {
        let mut map = HeaderMap::new();
        map.append("a", HeaderValue::from_static("1"));
        map.append("x", HeaderValue::from_static("2"));
        map.append("a", HeaderValue::from_static("3"));
        let list = HeaderList::from_header_map(&map);
        let names: Vec<_> = list.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "a", "x"]);
        assert_eq!(values(&list, "a"), vec!["1", "3"]);
    }

    #[test]
    fn hop_by_hop_dropped_case_insensitively() {
        let incoming = list(&[
            ("CONNECTION", "keep-alive"),
            ("keep-alive", "timeout=5"),
            ("Proxy-Authorization", "Basic Zm9v"),
            ("Proxy-Authenticate", "Basic"),
            ("te", "trailers"),
            ("Trailers", "Expires"),
            ("Transfer-Encoding", "chunked"),
            ("UPGRADE", "websocket"),
            ("Accept", "*/*"),
        ]);
        let out = transform().apply(&incoming);
        assert!(out.iter().all(|(name, _)| !is_hop_by_hop(name)));
        assert_eq!(out.get_str("accept"), Some("*/*"));
    }

    #[test]
    fn hop_by_hop_match_is_exact() {
        assert!(is_hop_by_hop("Te"));
        assert!(!is_hop_by_hop("Connection-Id"));
        assert!(!is_hop_by_hop("x-upgrade"));
    }

    #[test]
    fn via_and_forwarded_for_synthesized_once() {
        let out = transform().apply(&list(&[("Host", "example.com")]));
        assert_eq!(values(&out, "via"), vec!["1.1 box (media-tap/0.1.0)"]);
        assert_eq!(values(&out, "x-forwarded-for"), vec!["10.0.0.7"]);
    }

    #[test]
    fn existing_values_are_extended() {
        let incoming = list(&[("Via", "1.0 fred"), ("x-forwarded-for", "192.168.1.1")]);
        let out = transform().apply(&incoming);
        assert_eq!(values(&out, "via"), vec!["1.0 fred, 1.1 box (media-tap/0.1.0)"]);
        assert_eq!(values(&out, "X-Forwarded-For"), vec!["192.168.1.1, 10.0.0.7"]);
    }

    #[test]
    fn repeated_forwarding_lines_fold_into_one() {
        let incoming = list(&[
            ("X-Forwarded-For", "1.1.1.1"),
            ("Accept", "*/*"),
            ("X-Forwarded-For", "2.2.2.2"),
        ]);
        let out = transform().apply(&incoming);
        assert_eq!(values(&out, "x-forwarded-for"), vec!["1.1.1.1, 2.2.2.2, 10.0.0.7"]);
        // Position of the first occurrence is kept.
        assert_eq!(out.iter().next().map(|(n, _)| n), Some("X-Forwarded-For"));
    }

    #[test]
    fn stored_name_case_is_preserved() {
        let out = transform().apply(&list(&[("X-Custom-Thing", "Value With Case")]));
        let (name, value) = out.iter().next().unwrap();
        assert_eq!(name, "X-Custom-Thing");
        assert_eq!(value, "Value With Case");
    }

    #[test]
    fn round_trips_through_header_map() {
        let mut map = HeaderMap::new();
        map.append("accept", HeaderValue::from_static("a"));
        map.append("accept", HeaderValue::from_static("b"));
        let headers = HeaderList::from_header_map(&map);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.to_header_map().unwrap(), map);
    }

    #[test]
    fn via_token_names_crate() {
        assert_eq!(
            via_token("host1"),
            format!("1.1 host1 (media-tap/{})", env!("CARGO_PKG_VERSION"))
        );
    }
}
