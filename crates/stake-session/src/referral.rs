use crate::address::Address;

/// Append `?ref=<address>` to a page URL.
pub fn referral_link(base: &str, referrer: Address) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}ref={referrer}")
}

/// Pull a well-formed `ref` address out of a URL query string.
///
/// Accepts the query with or without its leading `?`. Malformed
/// addresses are ignored rather than reported.
pub fn referrer_from_query(query: &str) -> Option<Address> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "ref")
        .and_then(|(_, value)| value.parse().ok())
}
