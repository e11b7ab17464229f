//! Scratch directory for snippets extracted from documents.
//!
//! Snippet files are content addressed: the name is the first eight hex
//! digits of the SHA-256 of the content plus the language extension, so the
//! same snippet always runs from the same path and is written only once.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use sha2::Digest;
use sha2::Sha256;
use tempfile::NamedTempFile;

use crate::TOOL_NAME;
use crate::error::Result;
use crate::error::RunnerError;
use crate::fences::CodeBlock;

const HASH_PREFIX_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchDir {
    root: PathBuf,
}

impl Default for ScratchDir {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join(TOOL_NAME))
    }
}

impl ScratchDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Creates the directory if needed. An existing directory is fine.
    pub fn ensure(&self) -> Result<&Path> {
        if self.root.is_dir() {
            return Ok(&self.root);
        }
        std::fs::create_dir_all(&self.root)
            .map_err(|err| RunnerError::scratch_dir(&self.root, err))?;
        tracing::info!(dir = %self.root.display(), "created scratch directory");
        Ok(&self.root)
    }

    pub fn snippet_path(&self, block: &CodeBlock) -> PathBuf {
        self.root.join(format!(
            "{}{}",
            content_digest(&block.content),
            block.file_extension()
        ))
    }

    /// Writes `block` into the scratch directory unless an identical snippet
    /// is already there, and returns its path.
    pub fn materialize(&self, block: &CodeBlock) -> Result<PathBuf> {
        let dir = self.ensure()?;
        let path = self.snippet_path(block);
        if path.is_file() {
            tracing::debug!(path = %path.display(), "snippet already materialized");
            return Ok(path);
        }

        let bytes = block.text_encoding().encode(&block.content);
        let mut file =
            NamedTempFile::new_in(dir).map_err(|err| RunnerError::write_snippet(&path, err))?;
        file.write_all(&bytes)
            .and_then(|()| file.flush())
            .map_err(|err| RunnerError::write_snippet(&path, err))?;
        file.persist(&path)
            .map_err(|err| RunnerError::write_snippet(&path, err.error))?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "materialized snippet");
        Ok(path)
    }
}

fn content_digest(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = String::with_capacity(HASH_PREFIX_BYTES * 2);
    for byte in &digest[..HASH_PREFIX_BYTES] {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageRegistry;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn block(tag: &str, content: &str) -> CodeBlock {
        CodeBlock {
            tag: tag.to_string(),
            content: content.to_string(),
            language: LanguageRegistry::default().classify(tag),
            start_line: 0,
            end_line: 2,
        }
    }

    #[test]
    fn digest_is_first_eight_hex_chars_of_sha256() {
        // sha256("") = e3b0c442...
        assert_eq!(content_digest(""), "e3b0c442");
        // sha256("abc") = ba7816bf...
        assert_eq!(content_digest("abc"), "ba7816bf");
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchDir::new(dir.path().join("nested").join(TOOL_NAME));
        scratch.ensure().expect("first ensure");
        scratch.ensure().expect("second ensure");
        assert!(scratch.path().is_dir());
    }

    #[test]
    fn ensure_reports_unusable_root() {
        let dir = tempdir().expect("tempdir");
        let file = dir.path().join("occupied");
        std::fs::write(&file, "x").expect("write");
        let scratch = ScratchDir::new(file.join("sub"));
        assert!(matches!(
            scratch.ensure(),
            Err(RunnerError::ScratchDir { .. })
        ));
    }

    #[test]
    fn identical_content_maps_to_one_file() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchDir::new(dir.path());
        let first = scratch.materialize(&block("py", "print(1)\n")).expect("materialize");
        assert_eq!(
            first.file_name().and_then(|n| n.to_str()),
            Some(format!("{}.py", content_digest("print(1)\n")).as_str())
        );

        // Tamper with the file: a second materialization must not rewrite it.
        std::fs::write(&first, "marker").expect("overwrite");
        let second = scratch.materialize(&block("python", "print(1)\n")).expect("materialize");
        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&second).expect("read"), "marker");
    }

    #[test]
    fn utf16_languages_are_written_with_bom() {
        let dir = tempdir().expect("tempdir");
        let scratch = ScratchDir::new(dir.path());
        let path = scratch
            .materialize(&block("ps1", "Write-Output 1\n"))
            .expect("materialize");
        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(&bytes[..4], &[0xFF, 0xFE, b'W', 0]);
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("ps1"));
    }
}
