use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{Result, SegError};

const PROGRESS_PREFIX: &str = "PROGRESS:";
const RESULT_PREFIX: &str = "RESULT:";

/// One token of the runner's stdout channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Progress(u8),
    Result(PathBuf),
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress(value) => write!(f, "{PROGRESS_PREFIX}{value}"),
            Self::Result(path) => write!(f, "{RESULT_PREFIX}{}", path.display()),
        }
    }
}

/// Parses one stdout line.
///
/// Unknown lines, unparsable percentages and values above 100 yield `None`
/// so new tokens can be added without breaking older supervisors.
pub fn parse_line(line: &str) -> Option<JobEvent> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(value) = line.strip_prefix(PROGRESS_PREFIX) {
        let value: u8 = value.trim().parse().ok()?;
        return (value <= 100).then_some(JobEvent::Progress(value));
    }
    let path = line.strip_prefix(RESULT_PREFIX)?.trim();
    (!path.is_empty()).then(|| JobEvent::Result(PathBuf::from(path)))
}

/// Writes protocol tokens, flushing after every line.
pub struct ProtocolWriter<W: Write> {
    inner: W,
}

impl<W: Write> ProtocolWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn emit(&mut self, event: &JobEvent) -> Result<()> {
        writeln!(self.inner, "{event}")
            .and_then(|_| self.inner.flush())
            .map_err(|e| SegError::FileSystem {
                path: PathBuf::from("<stdout>"),
                operation: "protocol write".to_string(),
                source: e,
            })
    }

    pub fn progress(&mut self, value: u8) -> Result<()> {
        self.emit(&JobEvent::Progress(value.min(100)))
    }

    pub fn result(&mut self, metadata_path: &Path) -> Result<()> {
        self.emit(&JobEvent::Result(metadata_path.to_path_buf()))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
