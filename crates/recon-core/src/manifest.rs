//! Manifest text formats.
//!
//! Both manifests are newline-delimited UTF-8. A request manifest lists
//! command ids; a data manifest lists data-file name templates that may
//! contain date tokens (`%Y`, `%m`, `%d`, `%H`, `%%`). Tokens are resolved
//! against the date carried in the manifest's own name
//! (`..._YYYY_MM_DD[_HH]...`), falling back to its creation time.
//!
//! Malformed lines (invalid UTF-8) are logged and skipped; they never fail
//! the whole manifest.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::paths;

/// Prefix of data manifest file names.
pub const DATA_MANIFEST_PREFIX: &str = "DataFileManifest";

/// Prefix of request manifest file names.
pub const REQUEST_MANIFEST_PREFIX: &str = "RequestManifest";

/// Default extension appended to export file names.
pub const DEFAULT_EXPORT_EXTENSION: &str = ".json";

/// Which kind of manifest a file name denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// Lists data-file templates.
    Data,
    /// Lists command ids.
    Request,
}

impl ManifestKind {
    /// File-name prefix of this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Data => DATA_MANIFEST_PREFIX,
            Self::Request => REQUEST_MANIFEST_PREFIX,
        }
    }

    /// The other manifest of the pair.
    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Data => Self::Request,
            Self::Request => Self::Data,
        }
    }
}

/// A file name split at its first `_`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestName<'a> {
    /// Manifest kind, if the prefix names one.
    pub kind: Option<ManifestKind>,
    /// Text before the first `_` (the whole name if there is none).
    pub prefix: &'a str,
    /// Text after the first `_`; `None` if there is no `_` or nothing follows it.
    pub suffix: Option<&'a str>,
}

/// Splits a file name into manifest prefix and suffix.
#[must_use]
pub fn classify_name(name: &str) -> ManifestName<'_> {
    let (prefix, suffix) = match name.split_once('_') {
        Some((prefix, suffix)) => (prefix, Some(suffix).filter(|s| !s.is_empty())),
        None => (name, None),
    };
    let kind = if prefix.eq_ignore_ascii_case(DATA_MANIFEST_PREFIX) {
        Some(ManifestKind::Data)
    } else if prefix.eq_ignore_ascii_case(REQUEST_MANIFEST_PREFIX) {
        Some(ManifestKind::Request)
    } else {
        None
    };
    ManifestName {
        kind,
        prefix,
        suffix,
    }
}

/// Splits manifest content into trimmed, non-empty lines.
fn lines(content: &[u8], manifest: &str) -> Vec<String> {
    content
        .split(|b| *b == b'\n')
        .enumerate()
        .filter_map(|(idx, raw)| match std::str::from_utf8(raw) {
            Ok(line) => Some(line.trim().to_string()),
            Err(e) => {
                tracing::warn!(manifest, line = idx + 1, error = %e, "skipping malformed manifest line");
                None
            }
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Command ids read from a request manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandIdList {
    /// Canonical ids in first-seen order, without duplicates.
    pub ids: Vec<String>,
    /// Number of lines that repeated an earlier id.
    pub duplicates: usize,
}

/// Parses a request manifest.
#[must_use]
pub fn parse_command_ids(content: &[u8], manifest: &str) -> CommandIdList {
    let mut seen = HashSet::new();
    let mut result = CommandIdList::default();
    for line in lines(content, manifest) {
        let id = paths::canonicalize_command_id(&line);
        if seen.insert(id.clone()) {
            result.ids.push(id);
        } else {
            result.duplicates += 1;
        }
    }
    result
}

/// Parses a data manifest into its distinct templates, in first-seen order.
#[must_use]
pub fn parse_templates(content: &[u8], manifest: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    lines(content, manifest)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Finds a `_YYYY_MM_DD` date, optionally followed by `_HH`, in a name.
#[must_use]
pub fn date_from_name(name: &str) -> Option<NaiveDateTime> {
    let bytes = name.as_bytes();
    let digits = |start: usize, len: usize| -> Option<u32> {
        let slice = bytes.get(start..start + len)?;
        if slice.iter().all(u8::is_ascii_digit) {
            std::str::from_utf8(slice).ok()?.parse().ok()
        } else {
            None
        }
    };

    for (idx, _) in name.match_indices('_') {
        let year = digits(idx + 1, 4);
        let sep = |at: usize| bytes.get(at) == Some(&b'_');
        let (Some(year), true, Some(month), true, Some(day)) = (
            year,
            sep(idx + 5),
            digits(idx + 6, 2),
            sep(idx + 8),
            digits(idx + 9, 2),
        ) else {
            continue;
        };
        let Some(date) = i32::try_from(year)
            .ok()
            .and_then(|y| NaiveDate::from_ymd_opt(y, month, day))
        else {
            continue;
        };
        let hour = if sep(idx + 11) {
            digits(idx + 12, 2).filter(|h| *h < 24).unwrap_or(0)
        } else {
            0
        };
        return date.and_hms_opt(hour, 0, 0);
    }
    None
}

/// Substitutes date tokens in a template.
///
/// Unknown tokens are left as written.
#[must_use]
pub fn resolve_template(template: &str, at: NaiveDateTime) -> String {
    let mut out = String::with_capacity(template.len() + 8);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('Y') => out.push_str(&format!("{:04}", at.year())),
            Some('m') => out.push_str(&format!("{:02}", at.month())),
            Some('d') => out.push_str(&format!("{:02}", at.day())),
            Some('H') => out.push_str(&format!("{:02}", at.hour())),
            Some('%') => out.push('%'),
            _ => {
                out.push('%');
                continue;
            }
        }
        chars.next();
    }
    out
}

/// Package name of a data file: its name up to the first `_` or `.`.
#[must_use]
pub fn package_name(file_name: &str) -> &str {
    file_name
        .find(['_', '.'])
        .map_or(file_name, |idx| &file_name[..idx])
}

/// A data file resolved from one template of a data manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDataFile {
    /// Template as written in the manifest.
    pub template: String,
    /// Resolved file name.
    pub name: String,
    /// Path of the file, next to its manifest.
    pub path: String,
    /// Tracking tag (`{cosmos_tag}.{agent_id}.{name}`).
    pub tag: String,
    /// Name the file is exported under.
    pub export_name: String,
}

/// Context needed to resolve the templates of one data manifest.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    /// Storage location tag.
    pub cosmos_tag: &'a str,
    /// Agent id.
    pub agent_id: &'a str,
    /// Path of the data manifest.
    pub manifest_path: &'a str,
    /// Creation time of the data manifest.
    pub manifest_created: DateTime<Utc>,
    /// Extension appended to export names.
    pub export_extension: &'a str,
}

/// Resolves templates into data files. Templates resolving to the same name
/// produce one file.
#[must_use]
pub fn resolve_data_files(templates: &[String], ctx: &ResolveContext<'_>) -> Vec<ResolvedDataFile> {
    let manifest_name = paths::file_name(ctx.manifest_path);
    let at = date_from_name(manifest_name).unwrap_or_else(|| ctx.manifest_created.naive_utc());
    let dir = paths::parent(ctx.manifest_path);

    let mut seen = HashSet::new();
    templates
        .iter()
        .filter_map(|template| {
            let name = resolve_template(template, at);
            if !seen.insert(name.clone()) {
                return None;
            }
            Some(ResolvedDataFile {
                template: template.clone(),
                path: paths::join(dir, &name),
                tag: paths::file_tag(ctx.cosmos_tag, ctx.agent_id, &name),
                export_name: format!("{}{}", package_name(&name), ctx.export_extension),
                name,
            })
        })
        .collect()
}
