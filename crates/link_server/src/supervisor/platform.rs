//! Platform-specific launch recipes for the dedicated server.

use crate::error::{BridgeError, Result};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

/// Console command that makes the dedicated server save and exit.
pub const SHUTDOWN_COMMAND: &str = "stop";

/// Builds of the dedicated server the supervisor knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    Ubuntu,
}

impl Platform {
    /// Parses a configured platform name. Anything unrecognised is fatal.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "windows" => Ok(Platform::Windows),
            "ubuntu" | "linux" => Ok(Platform::Ubuntu),
            _ => Err(BridgeError::UnsupportedPlatform(name.to_string())),
        }
    }

    /// The build matching the host the bridge runs on.
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Ubuntu
        }
    }

    pub fn executable(self) -> &'static str {
        match self {
            Platform::Windows => "bedrock_server.exe",
            Platform::Ubuntu => "bedrock_server",
        }
    }

    /// Reports which build is installed in `dir`, if any.
    pub fn detect(dir: &Path) -> Option<Self> {
        [Platform::Ubuntu, Platform::Windows]
            .into_iter()
            .find(|platform| dir.join(platform.executable()).is_file())
    }

    /// How to launch this build from `dir`.
    pub fn launch_spec(self, dir: &Path) -> LaunchSpec {
        // Relative program paths combined with current_dir resolve differently
        // per OS, so anchor the directory first.
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let spec = LaunchSpec::new(dir.join(self.executable())).current_dir(&dir);

        match self {
            Platform::Windows => spec,
            // The Linux build ships its shared libraries next to the binary.
            Platform::Ubuntu => spec.env("LD_LIBRARY_PATH", "."),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::Ubuntu => write!(f, "ubuntu"),
        }
    }
}

/// Everything needed to spawn the child process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    /// Written to stdin to request a graceful shutdown
    pub shutdown_command: String,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            shutdown_command: SHUTDOWN_COMMAND.to_string(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}
