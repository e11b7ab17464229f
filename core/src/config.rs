//! Runner configuration.
//!
//! Configuration is owned by the host. The core polls a [`ConfigSource`] on
//! every call and never caches the result, so edits take effect on the next
//! run request.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::RunnerError;
use crate::language::LanguageAlias;
use crate::language::LanguageId;
use crate::language::LanguageRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for CommandTemplate {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Command template per language. Missing entries and blank templates both
/// mean "no runner configured".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerMap(BTreeMap<LanguageId, CommandTemplate>);

impl RunnerMap {
    pub fn get(&self, language: &LanguageId) -> Option<&CommandTemplate> {
        self.0.get(language).filter(|template| !template.is_empty())
    }

    pub fn insert(
        &mut self,
        language: impl Into<LanguageId>,
        template: impl Into<CommandTemplate>,
    ) {
        self.0.insert(language.into(), template.into());
    }

    /// Languages with a usable template, sorted.
    pub fn supported_languages(&self) -> Vec<LanguageId> {
        self.0
            .iter()
            .filter(|(_, template)| !template.is_empty())
            .map(|(language, _)| language.clone())
            .collect()
    }
}

impl<L: Into<LanguageId>, T: Into<CommandTemplate>> FromIterator<(L, T)> for RunnerMap {
    fn from_iter<I: IntoIterator<Item = (L, T)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(language, template)| (language.into(), template.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub runner_map: RunnerMap,
    /// Send commands to the interactive session instead of spawning them.
    pub run_in_terminal: bool,
    pub show_output_before_run: bool,
    pub clear_output_before_run: bool,
    /// Prefix the lines the runner writes to the output with a timestamp.
    pub show_debug_timestamps: bool,
    /// Roots used to pick the working directory of a spawned command.
    pub workspace_folders: Vec<PathBuf>,
    /// Extra fence tags, keyed by tag.
    pub languages: HashMap<String, LanguageAlias>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_map: default_runner_map(),
            run_in_terminal: false,
            show_output_before_run: true,
            clear_output_before_run: false,
            show_debug_timestamps: true,
            workspace_folders: Vec::new(),
            languages: HashMap::new(),
        }
    }
}

fn default_runner_map() -> RunnerMap {
    [
        ("shellscript", "bash {file}"),
        ("python", "python3 {file}"),
        ("javascript", "node {file}"),
        ("typescript", "npx --yes tsx {file}"),
        ("go", "go run {file}"),
        (
            "rust",
            "rustc {file} -o {scratchDir}{pathSeparator}{fileBasenameNoExtension} && {scratchDir}{pathSeparator}{fileBasenameNoExtension}",
        ),
        (
            "cpp",
            "g++ {file} -o {scratchDir}{pathSeparator}{fileBasenameNoExtension} && {scratchDir}{pathSeparator}{fileBasenameNoExtension}",
        ),
        ("ruby", "ruby {file}"),
        ("perl", "perl {file}"),
        ("lua", "lua {file}"),
        ("powershell", "powershell -ExecutionPolicy ByPass -File {file}"),
    ]
    .into_iter()
    .collect()
}

impl RunnerConfig {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|source| RunnerError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn language_registry(&self) -> LanguageRegistry {
        LanguageRegistry::with_aliases(&self.languages)
    }

    /// Deepest workspace folder containing `target`.
    pub fn workspace_folder_for(&self, target: &Path) -> Option<&Path> {
        self.workspace_folders
            .iter()
            .filter(|folder| target.starts_with(folder))
            .max_by_key(|folder| folder.components().count())
            .map(PathBuf::as_path)
    }
}

pub trait ConfigSource: Send + Sync {
    fn load(&self) -> RunnerConfig;
}

/// In-memory configuration that the host can change at any time.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<RunnerConfig>>,
}

impl SharedConfig {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut RunnerConfig)) {
        match self.inner.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl ConfigSource for SharedConfig {
    fn load(&self) -> RunnerConfig {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Reads a TOML file on every [`ConfigSource::load`]. A missing file means
/// defaults; an unreadable or invalid one is logged and also yields defaults.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
    overrides: ConfigOverrides,
}

/// Values the host forces on top of whatever the file says.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub run_in_terminal: Option<bool>,
    pub workspace_folders: Vec<PathBuf>,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            overrides: ConfigOverrides::default(),
        }
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn try_load(&self) -> Result<RunnerConfig> {
        let mut config = match std::fs::read_to_string(&self.path) {
            Ok(text) => RunnerConfig::from_toml(&text, &self.path)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RunnerConfig::default(),
            Err(source) => {
                return Err(RunnerError::ReadConfig {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if let Some(run_in_terminal) = self.overrides.run_in_terminal {
            config.run_in_terminal = run_in_terminal;
        }
        config
            .workspace_folders
            .extend(self.overrides.workspace_folders.iter().cloned());
        Ok(config)
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> RunnerConfig {
        match self.try_load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("{err}; falling back to default configuration");
                let mut config = RunnerConfig::default();
                config.workspace_folders = self.overrides.workspace_folders.clone();
                if let Some(run_in_terminal) = self.overrides.run_in_terminal {
                    config.run_in_terminal = run_in_terminal;
                }
                config
            }
        }
    }
}
