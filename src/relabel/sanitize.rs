use std::borrow::Cow;

use crate::metric::{Labels, METRIC_NAME_LABEL};

/// Returns true if `name` matches `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' || b == b':' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b':')
}

/// Returns true if `name` matches `[a-zA-Z_][a-zA-Z0-9_]*`.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() || b == b'_' => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub fn sanitize_metric_name(name: &str) -> Cow<'_, str> {
    if is_valid_metric_name(name) {
        return Cow::Borrowed(name);
    }
    Cow::Owned(replace_invalid(name, true))
}

pub fn sanitize_label_name(name: &str) -> Cow<'_, str> {
    if is_valid_label_name(name) {
        return Cow::Borrowed(name);
    }
    Cow::Owned(replace_invalid(name, false))
}

fn replace_invalid(name: &str, allow_colon: bool) -> String {
    if name.is_empty() {
        return "_".to_string();
    }
    name.chars()
        .enumerate()
        .map(|(i, c)| {
            let ok = c.is_ascii_alphabetic()
                || c == '_'
                || (allow_colon && c == ':')
                || (i > 0 && c.is_ascii_digit());
            if ok {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Prepares a series label set for serialization.
///
/// Sanitizes the `__name__` value and every label name, drops labels with
/// empty values, removes duplicate names (first wins) and sorts by name.
pub fn finalize(labels: &mut Labels) {
    let mut out = Labels::with_capacity(labels.len());
    for l in labels.iter() {
        if l.value.is_empty() {
            continue;
        }
        if l.name == METRIC_NAME_LABEL {
            out.push(
                METRIC_NAME_LABEL,
                sanitize_metric_name(&l.value).into_owned(),
            );
        } else {
            out.push(sanitize_label_name(&l.name).into_owned(), l.value.as_str());
        }
    }
    out.dedup_keep_first();
    out.sort();
    *labels = out;
}
