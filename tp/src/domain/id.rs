//! Task ID generation and partial-reference resolution
//!
//! IDs use the format `{6-char-hex}-task-{slug}`, e.g. `3fa9c1-task-add-logout-button`.

/// Generate a task ID from a title
pub fn generate_task_id(title: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    // v7 leads with the timestamp; take the random tail so same-title tasks don't collide
    let hex = &uuid[uuid.len() - 6..];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-task", hex)
    } else {
        format!("{}-task-{}", hex, slug)
    }
}

/// Slugify a title for use in IDs
fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(8)
        .collect::<Vec<_>>()
        .join("-")
}

/// Resolve a partial reference (exact id, hex prefix, or slug fragment) against known ids
///
/// Returns `Ok(Some(id))` for a unique match, `Ok(None)` for no match, and
/// `Err(candidates)` when the reference is ambiguous.
pub fn resolve_partial<'a>(ids: impl IntoIterator<Item = &'a str>, reference: &str) -> Result<Option<String>, Vec<String>> {
    let ids: Vec<&str> = ids.into_iter().collect();
    if ids.contains(&reference) {
        return Ok(Some(reference.to_string()));
    }

    let matches: Vec<String> = ids
        .into_iter()
        .filter(|id| {
            id.starts_with(reference)
                || id
                    .split_once('-')
                    .is_some_and(|(_, rest)| rest.contains(reference))
        })
        .map(str::to_string)
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.into_iter().next()),
        _ => Err(matches),
    }
}
