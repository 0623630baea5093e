use crate::case::{display_value, Variables};
use sha2::{Digest, Sha256};
use std::{
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to read template {0}")]
    ReadTemplate(PathBuf, #[source] std::io::Error),
    #[error("Template {0} has no file name")]
    InvalidTemplate(PathBuf),
    #[error("Failed to write input file")]
    WriteInput(#[from] std::io::Error),
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Turns a variable assignment into concrete input files
pub trait Renderer: Debug + Send + Sync {
    /// stable identity of the templates, part of every fingerprint
    fn identity(&self) -> String;

    /// write all input files for `variables` into `dir`
    fn render(&self, variables: &Variables, dir: &Path) -> Result<(), RenderError>;
}

/// Plain `${name}` substitution over a set of template files
#[derive(Debug, Clone, Default)]
pub struct TemplateRenderer {
    templates: Vec<(String, String)>,
}

impl TemplateRenderer {
    pub fn load(paths: &[PathBuf]) -> Result<Self, RenderError> {
        let templates = paths
            .iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .ok_or_else(|| RenderError::InvalidTemplate(path.clone()))?
                    .to_string_lossy()
                    .into_owned();
                let content = fs::read_to_string(path)
                    .map_err(|error| RenderError::ReadTemplate(path.clone(), error))?;

                Ok((name, content))
            })
            .collect::<Result<Vec<_>, RenderError>>()?;

        Ok(Self { templates })
    }

    pub fn from_strings<I, N, C>(templates: I) -> Self
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            templates: templates
                .into_iter()
                .map(|(name, content)| (name.into(), content.into()))
                .collect(),
        }
    }

    /// substitute every `${name}` known in `variables`, unknown names are left untouched
    pub fn substitute(template: &str, variables: &Variables) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];

                    match variables.get(name) {
                        Some(value) => rendered.push_str(&display_value(value)),
                        None => {
                            trace!(name = name, "Left unknown placeholder untouched");
                            rendered.push_str(&rest[start..start + 2 + end + 1]);
                        }
                    }

                    rest = &after[end + 1..];
                }
                None => {
                    rendered.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }

        rendered.push_str(rest);
        rendered
    }
}

impl Renderer for TemplateRenderer {
    fn identity(&self) -> String {
        let mut hasher = Sha256::new();

        for (name, content) in self.templates.iter() {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(content.as_bytes());
            hasher.update(b"\0");
        }

        format!("{:x}", hasher.finalize())
    }

    fn render(&self, variables: &Variables, dir: &Path) -> Result<(), RenderError> {
        for (name, template) in self.templates.iter() {
            fs::write(dir.join(name), Self::substitute(template, variables))?;
        }

        debug!(dir = ?dir, files = self.templates.len(), "Rendered inputs");

        Ok(())
    }
}
