//! Server endpoint normalization and redirect merging.

use url::Url;

/// Normalizes a server URL so equal endpoints compare equal.
///
/// A missing scheme defaults to `http`, host names are lowercased, default
/// ports and fragments are dropped, and an empty path becomes
/// `default_path`. Returns `None` when nothing usable remains.
pub fn normalize(raw: &str, default_path: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let mut url = Url::parse(&candidate).ok()?;
    if url.host_str().map_or(true, str::is_empty) {
        return None;
    }
    url.set_fragment(None);
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(default_path);
    }
    Some(url.into())
}

/// Builds the target of a server redirect.
///
/// Parts missing from `redirect` (host, port, scheme, path) are taken from
/// `previous`, with `default_path` standing in for a missing path.
pub fn merge_redirect(redirect: Option<&str>, previous: &str, default_path: &str) -> Option<String> {
    let redirect = redirect.map(str::trim).filter(|s| !s.is_empty());
    let mut url = Url::parse(previous).ok()?;

    // A bare host borrows the scheme of the previous endpoint.
    let qualified = redirect.filter(|r| !r.starts_with('/')).map(|r| {
        if r.contains("://") {
            r.to_string()
        } else {
            format!("{}://{r}", url.scheme())
        }
    });
    if let Some(absolute) = qualified
        .and_then(|r| Url::parse(&r).ok())
        .filter(|u| u.host_str().is_some_and(|h| !h.is_empty()))
    {
        return normalize(absolute.as_str(), default_path);
    }

    url.set_query(None);
    url.set_fragment(None);
    match redirect {
        Some(path) if path.starts_with('/') => url = url.join(path).ok()?,
        _ => url.set_path(default_path),
    }
    Some(url.into())
}
