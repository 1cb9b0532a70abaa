use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::{Result, SegError};

/// Parent variables a runner may see. Everything else is dropped.
pub const ALLOWED_VARS: &[&str] = &[
    "SYSTEMROOT",
    "SYSTEMDRIVE",
    "TEMP",
    "TMP",
    "USERPROFILE",
    "HOME",
    "TILESEG_LOG",
    "ORT_DYLIB_PATH",
];

/// Builds a subprocess environment from an explicit allow-list.
///
/// The parent environment is never inherited wholesale; `PATH` in particular
/// is assembled from the given directories plus the platform's system
/// binary directories.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentBuilder {
    vars: BTreeMap<OsString, OsString>,
    path: Vec<PathBuf>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the allow-listed variables that are set in this process.
    pub fn from_parent() -> Self {
        Self::new().allow_from(|name| std::env::var_os(name))
    }

    pub fn allow_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        for name in ALLOWED_VARS {
            if let Some(value) = lookup(name) {
                self.vars.insert(OsString::from(name), value);
            }
        }
        self
    }

    pub fn var(mut self, name: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn path_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if !self.path.contains(&dir) {
            self.path.push(dir);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(name)).map(OsString::as_os_str)
    }

    /// Final variable set, `PATH` included.
    pub fn build(&self) -> Result<Vec<(OsString, OsString)>> {
        let mut dirs = self.path.clone();
        for dir in self.system_dirs() {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        let path = std::env::join_paths(&dirs).map_err(|e| SegError::Configuration {
            message: format!("cannot build PATH for runner: {e}"),
        })?;

        let mut vars: Vec<_> = self
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.push((OsString::from("PATH"), path));
        debug!(count = vars.len(), "runner environment");
        Ok(vars)
    }

    /// Clears the command's environment and installs ours.
    pub fn apply(&self, command: &mut tokio::process::Command) -> Result<()> {
        command.env_clear().envs(self.build()?);
        Ok(())
    }

    #[cfg(windows)]
    fn system_dirs(&self) -> Vec<PathBuf> {
        let root = self
            .get("SYSTEMROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
        vec![root.join("System32"), root]
    }

    #[cfg(not(windows))]
    fn system_dirs(&self) -> Vec<PathBuf> {
        ["/usr/local/bin", "/usr/bin", "/bin"]
            .iter()
            .map(PathBuf::from)
            .collect()
    }
}

/// Directory holding `executable`, used as the first `PATH` entry.
pub fn executable_dir(executable: &Path) -> Option<PathBuf> {
    executable
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_parent(name: &str) -> Option<OsString> {
        match name {
            "HOME" => Some("/home/analyst".into()),
            "TILESEG_LOG" => Some("debug".into()),
            "AWS_SECRET_ACCESS_KEY" => Some("hunter2".into()),
            _ => None,
        }
    }

    #[test]
    fn only_allow_listed_variables_are_copied() -> Result<()> {
        let env = EnvironmentBuilder::new().allow_from(fake_parent);
        let vars = env.build()?;
        let names: Vec<_> = vars.iter().map(|(k, _)| k.to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["HOME", "TILESEG_LOG", "PATH"]);
        assert_eq!(env.get("HOME"), Some(OsStr::new("/home/analyst")));
        assert_eq!(env.get("AWS_SECRET_ACCESS_KEY"), None);
        Ok(())
    }

    #[test]
    fn path_starts_with_runner_dir() -> Result<()> {
        let vars = EnvironmentBuilder::new()
            .path_dir("/opt/tileseg/bin")
            .path_dir("/opt/tileseg/bin")
            .build()?;
        let (_, path) = vars.iter().find(|(k, _)| k == "PATH").unwrap();
        let dirs: Vec<_> = std::env::split_paths(path).collect();
        assert_eq!(dirs[0], PathBuf::from("/opt/tileseg/bin"));
        assert_eq!(dirs.iter().filter(|d| d.ends_with("tileseg/bin")).count(), 1);
        assert!(dirs.len() > 1);
        Ok(())
    }

    #[test]
    fn executable_dir_of_bare_name_is_none() {
        assert_eq!(executable_dir(Path::new("tileseg-runner")), None);
        assert_eq!(
            executable_dir(Path::new("/usr/lib/tileseg/tileseg-runner")),
            Some(PathBuf::from("/usr/lib/tileseg"))
        );
    }
}
