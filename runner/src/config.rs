
use crate::{
    calculators::{
        remote::StagingConfig, CalculatorDescriptor, CalculatorSettings, Calculators, Endpoint,
    },
    case::generator::DesignSpec,
    discovery::{DiscoveryConfig, DiscoveryService},
    dispatcher::{DispatchOptions, Dispatcher},
    extract::{OutputSpec, ShellExtractor},
    render::{RenderError, TemplateRenderer},
    resolve::ToolResolver,
    store::{compile_pattern, CaseNaming, ResultStore, StoreError},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

/// entry expanded into the alias set of the same name
pub const WILDCARD: &str = "*";

/// upper bound for evaluating a single output expression
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read configuration {0}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse configuration")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid calculator '{uri}': {reason}")]
    InvalidEndpoint { uri: String, reason: String },
    #[error("Calculator alias '{0}' is not defined")]
    UnknownAlias(String),
    #[error("Required program '{0}' was not found")]
    MissingTool(&'static str),
    #[error("Failed to load templates")]
    Template(#[from] RenderError),
    #[error("Failed to open the result store")]
    Store(#[from] StoreError),
    #[error("Configuration failed the preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// files rendered into every case directory, relative to the configuration file
    #[serde(default)]
    pub templates: Vec<PathBuf>,
    pub design: DesignSpec,
    #[serde(default)]
    pub outputs: OutputSpec,
    /// in order of preference, caches are consulted before any executor
    pub calculators: Vec<CalculatorEntry>,
    #[serde(default)]
    pub aliases: IndexMap<String, Vec<CalculatorEntry>>,
    #[serde(default)]
    pub results: ResultsConfig,
    /// attempts per case, defaults to the number of executor slots
    #[serde(default)]
    pub max_attempts: Option<usize>,
    /// seconds per attempt
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub ssh: SshConfig,
}

/// A calculator either as plain uri or with an explicit concurrency
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum CalculatorEntry {
    Uri(String),
    Detailed {
        uri: String,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
    },
}

impl CalculatorEntry {
    pub fn uri(&self) -> &str {
        match self {
            Self::Uri(uri) | Self::Detailed { uri, .. } => uri,
        }
    }

    pub fn concurrency(&self) -> usize {
        match self {
            Self::Uri(_) => default_concurrency(),
            Self::Detailed { concurrency, .. } => *concurrency,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResultsConfig {
    #[serde(default = "default_results_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub naming: CaseNaming,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            root: default_results_root(),
            naming: CaseNaming::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default)]
    pub staging: StagingConfig,
    /// seconds, also used when connecting to daemons
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            staging: StagingConfig::default(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl RunConfig {
    /// Read a configuration, templates are resolved relative to its directory
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content =
            fs::read_to_string(path).map_err(|error| ConfigErrors::Read(path.to_path_buf(), error))?;
        let mut config = Self::from_yaml(&content)?;

        if let Some(base) = path.parent() {
            for template in config.templates.iter_mut() {
                if template.is_relative() {
                    *template = base.join(&*template);
                }
            }
        }

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Calculator entries with aliases replaced by their members, in configured order
    pub fn expanded_calculators(&self) -> Result<Vec<CalculatorEntry>, ConfigErrors> {
        let mut entries = Vec::new();

        for entry in self.calculators.iter() {
            match self.aliases.get(entry.uri()) {
                Some(members) => entries.extend(members.iter().cloned()),
                None if entry.uri() == WILDCARD => {
                    return Err(ConfigErrors::UnknownAlias(WILDCARD.to_string()))
                }
                None => entries.push(entry.clone()),
            }
        }

        Ok(entries)
    }

    pub fn calculator_descriptors(&self) -> Result<Vec<CalculatorDescriptor>, ConfigErrors> {
        self.expanded_calculators()?
            .iter()
            .map(|entry| CalculatorDescriptor::parse(entry.uri(), entry.concurrency()))
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }

    pub fn settings(&self, resolver: Arc<dyn ToolResolver>) -> CalculatorSettings {
        CalculatorSettings {
            resolver,
            discovery: Arc::new(DiscoveryService::new(self.discovery.clone())),
            staging: self.ssh.staging.build(),
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout.max(1)),
            poll_interval: self.discovery.poll_interval(),
        }
    }

    pub fn renderer(&self) -> Result<TemplateRenderer, ConfigErrors> {
        Ok(TemplateRenderer::load(&self.templates)?)
    }

    /// Build a dispatcher over every configured calculator, nothing runs yet
    pub fn dispatcher(
        &self,
        renderer: Arc<TemplateRenderer>,
        resolver: Arc<dyn ToolResolver>,
    ) -> Result<Dispatcher, ConfigErrors> {
        let shell = resolver.resolve("sh").ok_or(ConfigErrors::MissingTool("sh"))?;
        let settings = self.settings(resolver);
        let calculators = self
            .calculator_descriptors()?
            .into_iter()
            .map(|descriptor| Calculators::load(descriptor, &settings))
            .collect::<Result<Vec<_>, _>>()?;
        let store = ResultStore::open(&self.results.root, self.results.naming)?;

        Ok(Dispatcher::new(
            calculators,
            store,
            renderer,
            Arc::new(ShellExtractor::new(shell, EXTRACT_TIMEOUT)),
            self.outputs.clone(),
            DispatchOptions {
                max_attempts: self.max_attempts,
                timeout: self.timeout(),
            },
        ))
    }

    /// Check everything that can be checked before dispatching. All problems are logged instead
    /// of stopping at the first one, returns true if any was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        match self.expanded_calculators() {
            Err(error) => {
                error!("calculators: {error}");
                contains_error = true;
            }
            Ok(entries) if entries.is_empty() => {
                error!("No calculator was defined, unable to run any case");
                contains_error = true;
            }
            Ok(entries) => {
                for (position, entry) in entries.iter().enumerate() {
                    match CalculatorDescriptor::parse(entry.uri(), entry.concurrency()) {
                        Ok(descriptor) => {
                            if let Endpoint::Cache { pattern } = &descriptor.endpoint {
                                if let Err(error) = compile_pattern(pattern) {
                                    error!("calculators[{position}] has an invalid glob '{pattern}': {error}");
                                    contains_error = true;
                                }
                            }
                        }
                        Err(error) => {
                            error!("calculators[{position}]: {error}");
                            contains_error = true;
                        }
                    }
                }

                if entries
                    .iter()
                    .all(|entry| entry.uri().starts_with("cache://"))
                {
                    warn!("Only caches are configured, every case missing from them will fail");
                }
            }
        }

        for template in self.templates.iter() {
            if !template.is_file() {
                error!(
                    "Template {} is either not a file or not found",
                    template.to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.outputs.is_empty() {
            warn!("No outputs were requested, the result table will only hold variables");
        }

        if self.timeout == Some(0) {
            error!("timeout cannot be 0, omit it to disable timeouts");
            contains_error = true;
        }

        if self.max_attempts == Some(0) {
            error!("max_attempts cannot be 0");
            contains_error = true;
        }

        if self.discovery.window_ms == 0 {
            error!("discovery.window_ms cannot be 0, no daemon could ever be found");
            contains_error = true;
        }

        contains_error
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_results_root() -> PathBuf {
    PathBuf::from("results")
}

fn default_connect_timeout() -> u64 {
    10
}
