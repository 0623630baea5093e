use once_cell::sync::Lazy;
use std::{
    env,
    fmt::Debug,
    fs::File,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Directories searched after `PATH`, commands assume the usual unix utilities live there
static FALLBACK_DIRS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    ["/bin", "/usr/bin", "/usr/local/bin"]
        .iter()
        .map(PathBuf::from)
        .collect()
});

/// check if a file is executable
pub fn check_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    match File::open(path).map(|file| file.metadata()) {
        Ok(Ok(metadata)) => (metadata.mode() & 0o111) != 0,
        Ok(Err(error)) | Err(error) => {
            warn!(path = ?path, error = ?error, "Failed to read metadata");
            false
        }
    }
}

/// Resolves utility programs (`sh`, `ssh`, `scp`) to absolute paths
pub trait ToolResolver: Debug + Send + Sync {
    fn resolve(&self, program: &str) -> Option<PathBuf>;
}

/// Searches `PATH` followed by the usual system directories
#[derive(Debug, Clone, Default)]
pub struct SearchPath {
    extra: Vec<PathBuf>,
}

impl SearchPath {
    /// search the given directories before anything else
    pub fn with_dirs(extra: Vec<PathBuf>) -> Self {
        Self { extra }
    }
}

impl ToolResolver for SearchPath {
    fn resolve(&self, program: &str) -> Option<PathBuf> {
        let direct = Path::new(program);

        if direct.is_absolute() {
            return check_executable(direct).then(|| direct.to_path_buf());
        }

        let from_env = env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).collect::<Vec<_>>())
            .unwrap_or_default();

        let found = self
            .extra
            .iter()
            .chain(from_env.iter())
            .chain(FALLBACK_DIRS.iter())
            .map(|dir| dir.join(program))
            .find(|candidate| check_executable(candidate));

        debug!(program = program, found = ?found, "Resolved program");

        found
    }
}
