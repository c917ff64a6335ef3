use sha2::{Digest, Sha256};
use url::Url;

/// Join base url with another (possibly relative) url
pub fn join_url(current_url: &str, url: &str) -> Option<String> {
    let base = Url::parse(current_url).ok()?;
    base.join(url).ok().map(|u| u.to_string())
}

pub fn get_host(url: &str) -> Option<String> {
    let url_ = Url::parse(url).ok()?;
    url_.host_str().map(|x| x.to_ascii_lowercase())
}

/// Canonical form of a locator for identity purposes.
///
/// Scheme and host are lowercased and default ports dropped by the parser,
/// query arguments are sorted by key then value (blank values kept) and the
/// fragment is removed unless `keep_fragments` is set. Anything that does not
/// parse as a URL is returned untouched.
pub fn canonicalize_url(raw: &str, keep_fragments: bool) -> String {
    let mut url = match Url::parse(raw.trim()) {
        Ok(url) => url,
        Err(_) => return raw.to_owned(),
    };

    if url.query().is_some() {
        let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        pairs.sort();
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs.iter());
        }
    }

    if !keep_fragments {
        url.set_fragment(None);
    }
    url.to_string()
}

/// Turn an arbitrary slot name (usually a host) into a string that is safe to
/// use as a directory name. A short digest keeps distinct names distinct
/// after sanitising.
pub fn slot_dir_name(name: &str) -> String {
    let mut clean: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .take(64)
        .collect();
    if clean.is_empty() {
        clean.push('_');
    }
    let digest = Sha256::digest(name.as_bytes());
    format!("{}-{}", clean, hex::encode(&digest[..4]))
}
