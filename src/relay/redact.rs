use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// A `token` or `api_token` parameter (`_` possibly percent-encoded) with a
/// hex value, plus one adjoining `&`.
static TOKEN_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)&(?:api(?:_|%5F))?token=[0-9a-f]+|(?:api(?:_|%5F))?token=[0-9a-f]+&?")
        .expect("token pattern is valid")
});

/// Removes every token parameter from a form-encoded body.
///
/// Replacement runs until nothing matches, so text joined around a removed
/// parameter cannot form a new token.
pub fn redact_tokens(body: &str) -> Cow<'_, str> {
    let mut redacted = Cow::Borrowed(body);
    while TOKEN_PARAM.is_match(&redacted) {
        redacted = Cow::Owned(TOKEN_PARAM.replace_all(&redacted, "").into_owned());
    }
    redacted
}

/// Redacts token parameters from the query of `url`. The `?` is dropped when
/// nothing is left of the query.
pub fn redact_url(url: &str) -> Cow<'_, str> {
    let Some((base, query)) = url.split_once('?') else {
        return Cow::Borrowed(url);
    };
    let (query, fragment) = match query.split_once('#') {
        Some((query, fragment)) => (query, Some(fragment)),
        None => (query, None),
    };

    let redacted = redact_tokens(query);
    if matches!(redacted, Cow::Borrowed(_)) {
        return Cow::Borrowed(url);
    }

    let mut sanitized = String::with_capacity(url.len());
    sanitized.push_str(base);
    if !redacted.is_empty() {
        sanitized.push('?');
        sanitized.push_str(&redacted);
    }
    if let Some(fragment) = fragment {
        sanitized.push('#');
        sanitized.push_str(fragment);
    }
    Cow::Owned(sanitized)
}

/// True when `body` still contains a token parameter.
pub fn contains_token(body: &str) -> bool {
    TOKEN_PARAM.is_match(body)
}
