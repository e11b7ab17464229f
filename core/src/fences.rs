//! Fenced code block extraction.
//!
//! A block opens on any line whose trimmed text starts with "```" and closes
//! on the next line whose trimmed text is exactly "```". A fence carrying a
//! tag never closes a block; it is kept as content. A block that is never
//! closed is dropped, together with everything after it.

use std::str::Lines;

use crate::language::LanguageId;
use crate::language::LanguageRegistry;
use crate::language::LanguageSpec;
use crate::language::TextEncoding;

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Tag exactly as declared after the opening fence, trimmed.
    pub tag: String,
    /// Lines between the fences, each terminated by `\n`.
    pub content: String,
    pub language: LanguageSpec,
    /// Zero-based line of the opening fence.
    pub start_line: usize,
    /// Zero-based line of the closing fence.
    pub end_line: usize,
}

impl CodeBlock {
    pub fn language_id(&self) -> &LanguageId {
        &self.language.language_id
    }

    pub fn file_extension(&self) -> &str {
        &self.language.file_extension
    }

    pub fn text_encoding(&self) -> TextEncoding {
        self.language.text_encoding
    }
}

/// Lazy iterator over the code blocks of a document, in document order.
pub struct CodeBlocks<'a> {
    lines: std::iter::Enumerate<Lines<'a>>,
    registry: &'a LanguageRegistry,
    exhausted: bool,
}

pub fn extract_code_blocks<'a>(text: &'a str, registry: &'a LanguageRegistry) -> CodeBlocks<'a> {
    CodeBlocks {
        lines: text.lines().enumerate(),
        registry,
        exhausted: false,
    }
}

impl Iterator for CodeBlocks<'_> {
    type Item = CodeBlock;

    fn next(&mut self) -> Option<CodeBlock> {
        if self.exhausted {
            return None;
        }

        let (start_line, tag) = loop {
            let Some((idx, line)) = self.lines.next() else {
                self.exhausted = true;
                return None;
            };
            if let Some(tag) = opening_tag(line) {
                break (idx, tag.to_string());
            }
        };

        let mut content = String::new();
        for (idx, line) in self.lines.by_ref() {
            if is_bare_fence(line) {
                let language = self.registry.classify(&tag);
                return Some(CodeBlock {
                    tag,
                    content,
                    language,
                    start_line,
                    end_line: idx,
                });
            }
            content.push_str(line);
            content.push('\n');
        }

        tracing::debug!(start_line, tag = %tag, "skipping unterminated code block");
        self.exhausted = true;
        None
    }
}

fn opening_tag(line: &str) -> Option<&str> {
    line.trim().strip_prefix(FENCE).map(str::trim)
}

fn is_bare_fence(line: &str) -> bool {
    line.trim() == FENCE
}
