//! Fence tag classification.
//!
//! The registry maps a declared fence tag (`py`, `Bash`, `c++`, ...) to a
//! canonical [`LanguageId`], the extension used when a snippet is written to
//! disk, and the text encoding that file must use. Classification never
//! fails: unknown tags classify as themselves.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct LanguageId(String);

impl LanguageId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LanguageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for LanguageId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<LanguageId> for String {
    fn from(value: LanguageId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// UTF-16 little endian, prefixed with a byte order mark.
    Utf16Le,
}

impl TextEncoding {
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Utf16Le => {
                let mut bytes = Vec::with_capacity(2 + text.len() * 2);
                bytes.extend_from_slice(&[0xFF, 0xFE]);
                for unit in text.encode_utf16() {
                    bytes.extend_from_slice(&unit.to_le_bytes());
                }
                bytes
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub language_id: LanguageId,
    /// Extension including the leading dot.
    pub file_extension: String,
    pub text_encoding: TextEncoding,
}

impl LanguageSpec {
    pub fn new(language_id: &str, file_extension: &str, text_encoding: TextEncoding) -> Self {
        Self {
            language_id: LanguageId::new(language_id),
            file_extension: file_extension.to_string(),
            text_encoding,
        }
    }

    fn fallback(tag: &str) -> Self {
        Self {
            language_id: LanguageId(tag.to_string()),
            file_extension: format!(".{tag}"),
            text_encoding: TextEncoding::Utf8,
        }
    }
}

/// User supplied alias, as found under `[languages.<tag>]` in the config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageAlias {
    pub language_id: String,
    pub file_extension: String,
    #[serde(default)]
    pub text_encoding: TextEncoding,
}

const BUILTIN_LANGUAGES: &[(&[&str], &str, &str, TextEncoding)] = &[
    (&["sh", "shell", "bash"], "shellscript", ".sh", TextEncoding::Utf8),
    (&["zsh"], "shellscript", ".zsh", TextEncoding::Utf8),
    (&["cpp", "c++"], "cpp", ".cpp", TextEncoding::Utf8),
    (&["c"], "c", ".c", TextEncoding::Utf8),
    (&["go", "golang"], "go", ".go", TextEncoding::Utf8),
    (&["javascript", "js"], "javascript", ".js", TextEncoding::Utf8),
    (&["typescript", "ts"], "typescript", ".ts", TextEncoding::Utf8),
    (&["python", "py"], "python", ".py", TextEncoding::Utf8),
    (&["rust", "rs"], "rust", ".rs", TextEncoding::Utf8),
    (&["ruby", "rb"], "ruby", ".rb", TextEncoding::Utf8),
    (&["perl", "pl"], "perl", ".pl", TextEncoding::Utf8),
    (&["lua"], "lua", ".lua", TextEncoding::Utf8),
    (&["php"], "php", ".php", TextEncoding::Utf8),
    (&["java"], "java", ".java", TextEncoding::Utf8),
    (&["csharp", "cs", "c#"], "csharp", ".cs", TextEncoding::Utf8),
    (&["bat", "cmd", "batch"], "bat", ".bat", TextEncoding::Utf8),
    // Windows script hosts only read these reliably as UTF-16 with a BOM.
    (&["powershell", "ps1", "pwsh"], "powershell", ".ps1", TextEncoding::Utf16Le),
    (&["vbscript", "vbs"], "vbscript", ".vbs", TextEncoding::Utf16Le),
];

#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    by_tag: HashMap<String, LanguageSpec>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        let mut by_tag = HashMap::new();
        for (tags, language_id, extension, encoding) in BUILTIN_LANGUAGES {
            let spec = LanguageSpec::new(language_id, extension, *encoding);
            for tag in *tags {
                by_tag.insert((*tag).to_string(), spec.clone());
            }
        }
        Self { by_tag }
    }
}

impl LanguageRegistry {
    /// Builtin table extended (or overridden) by user aliases.
    pub fn with_aliases<'a>(
        aliases: impl IntoIterator<Item = (&'a String, &'a LanguageAlias)>,
    ) -> Self {
        let mut registry = Self::default();
        for (tag, alias) in aliases {
            registry.insert_alias(tag, alias);
        }
        registry
    }

    pub fn insert_alias(&mut self, tag: &str, alias: &LanguageAlias) {
        let extension = if alias.file_extension.starts_with('.') {
            alias.file_extension.clone()
        } else {
            format!(".{}", alias.file_extension)
        };
        self.by_tag.insert(
            normalize_tag(tag),
            LanguageSpec::new(&alias.language_id, &extension, alias.text_encoding),
        );
    }

    pub fn classify(&self, tag: &str) -> LanguageSpec {
        let tag = normalize_tag(tag);
        match self.by_tag.get(&tag) {
            Some(spec) => spec.clone(),
            None => LanguageSpec::fallback(&tag),
        }
    }

    /// Guesses the language of a file from its extension, e.g. `main.py` is
    /// `python`. Files without an extension have no language.
    pub fn language_for_path(&self, path: &std::path::Path) -> Option<LanguageId> {
        let extension = path.extension()?.to_str()?;
        let known = self
            .by_tag
            .values()
            .find(|spec| spec.file_extension.eq_ignore_ascii_case(&format!(".{extension}")));
        match known {
            Some(spec) => Some(spec.language_id.clone()),
            None => Some(self.classify(extension).language_id),
        }
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}
