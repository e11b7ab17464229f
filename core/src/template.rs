//! Command template expansion.
//!
//! Templates are plain strings such as `python3 {file}`. Expansion is a
//! single left-to-right scan: each `{name}` token naming a known placeholder
//! is replaced by its value, anything else is copied verbatim. Values are
//! inserted as-is; the expanded text goes to the shell without escaping.

use std::path::MAIN_SEPARATOR_STR;
use std::path::Path;

pub const PLACEHOLDERS: &[&str] = &[
    "file",
    "fileDir",
    "fileBasename",
    "fileBasenameNoExtension",
    "fileExtname",
    "fileDirnameBasename",
    "pathSeparator",
    "scratchDir",
];

/// Placeholder values resolved from a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderValues {
    pub file: String,
    pub file_dir: String,
    pub file_basename: String,
    pub file_basename_no_extension: String,
    pub file_extname: String,
    pub file_dirname_basename: String,
    pub path_separator: String,
    pub scratch_dir: String,
}

impl PlaceholderValues {
    pub fn resolve(target: &Path, scratch_dir: &Path) -> Self {
        let parent = target.parent().unwrap_or_else(|| Path::new(""));
        Self {
            file: target.display().to_string(),
            file_dir: parent.display().to_string(),
            file_basename: os_to_string(target.file_name()),
            file_basename_no_extension: os_to_string(target.file_stem()),
            file_extname: os_to_string(target.extension()),
            file_dirname_basename: os_to_string(parent.file_name()),
            path_separator: MAIN_SEPARATOR_STR.to_string(),
            scratch_dir: scratch_dir.display().to_string(),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        let value = match name {
            "file" => &self.file,
            "fileDir" => &self.file_dir,
            "fileBasename" => &self.file_basename,
            "fileBasenameNoExtension" => &self.file_basename_no_extension,
            "fileExtname" => &self.file_extname,
            "fileDirnameBasename" => &self.file_dirname_basename,
            "pathSeparator" => &self.path_separator,
            "scratchDir" => &self.scratch_dir,
            _ => return None,
        };
        Some(value.as_str())
    }
}

fn os_to_string(value: Option<&std::ffi::OsStr>) -> String {
    value
        .map(|v| v.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub fn expand(template: &str, target: &Path, scratch_dir: &Path) -> String {
    expand_with(template, &PlaceholderValues::resolve(target, scratch_dir))
}

pub fn expand_with(template: &str, values: &PlaceholderValues) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        let replaced = after_open.find('}').and_then(|close| {
            values
                .lookup(&after_open[..close])
                .map(|value| (value, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after_open[close + 1..];
            }
            None => {
                // Not a placeholder; keep the brace and rescan after it so
                // `{{file}` still expands the inner token.
                out.push('{');
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}
