//! Path, tag and identifier helpers.
//!
//! Tags use the `{cosmos_tag}.{agent_id}.{file_name}` convention. Table keys
//! cannot contain `/`, `\`, `#` or `?`, so paths are escaped before they are
//! used as row keys.

/// Builds the tag that tracks one data file inside a manifest state row.
#[must_use]
pub fn file_tag(cosmos_tag: &str, agent_id: &str, file_name: &str) -> String {
    format!("{cosmos_tag}.{agent_id}.{file_name}")
}

/// Splits a tag into `(cosmos_tag, agent_id, file_name)`.
///
/// The file name may itself contain dots; only the first two separate parts.
#[must_use]
pub fn split_file_tag(tag: &str) -> Option<(&str, &str, &str)> {
    let mut parts = tag.splitn(3, '.');
    let cosmos_tag = parts.next()?;
    let agent_id = parts.next()?;
    let file_name = parts.next()?;
    Some((cosmos_tag, agent_id, file_name))
}

/// Normalizes a command id: dashes removed, lowercased.
#[must_use]
pub fn canonicalize_command_id(id: &str) -> String {
    id.chars()
        .filter(|c| *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Returns `path` with exactly one trailing slash.
#[must_use]
pub fn ensure_trailing_slash(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    format!("{trimmed}/")
}

/// Returns `path` without leading slashes.
#[must_use]
pub fn ensure_no_leading_slash(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Joins path segments with single slashes.
#[must_use]
pub fn join(base: &str, child: &str) -> String {
    if base.is_empty() {
        return child.to_string();
    }
    format!("{}{}", ensure_trailing_slash(base), ensure_no_leading_slash(child))
}

/// Returns the directory portion of a path (everything before the last `/`).
#[must_use]
pub fn parent(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

/// Returns the final component of a path.
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

/// Escapes a value for use as a table partition or row key.
#[must_use]
pub fn escape_key(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            '#' => out.push_str("%23"),
            '?' => out.push_str("%3F"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_with_dotted_file_name() {
        let tag = file_tag("cosmos1", "agent", "DATAFILE_2018_01_02.txt");
        assert_eq!(tag, "cosmos1.agent.DATAFILE_2018_01_02.txt");
        assert_eq!(
            split_file_tag(&tag),
            Some(("cosmos1", "agent", "DATAFILE_2018_01_02.txt"))
        );
        assert_eq!(split_file_tag("no-dots"), None);
    }

    #[test]
    fn command_ids_are_canonical() {
        assert_eq!(
            canonicalize_command_id("4F2A-11B0-CC"),
            canonicalize_command_id("4f2a11b0cc")
        );
        assert_eq!(canonicalize_command_id("AB-CD"), "abcd");
    }

    #[test]
    fn path_helpers() {
        assert_eq!(ensure_trailing_slash("a/b"), "a/b/");
        assert_eq!(ensure_trailing_slash("a/b//"), "a/b/");
        assert_eq!(ensure_no_leading_slash("//a"), "a");
        assert_eq!(join("root/", "/agent"), "root/agent");
        assert_eq!(join("", "agent"), "agent");
        assert_eq!(parent("/PATH/MFILE.txt"), "/PATH");
        assert_eq!(parent("MFILE.txt"), "");
        assert_eq!(file_name("/PATH/MFILE.txt"), "MFILE.txt");
    }

    #[test]
    fn escaped_keys_have_no_reserved_characters() {
        let key = escape_key("root/agent/DataFileManifest_1?#\\%");
        assert!(!key.contains(['/', '?', '#', '\\']));
        assert_eq!(escape_key("a%2F"), "a%252F");
    }
}
