pub mod add_machine;
pub mod add_relation;
pub mod add_unit;
pub mod deploy;
pub mod destroy_unit;
pub mod init;
pub mod resolved;
pub mod set_status;
pub mod status;
pub mod watch;

use cairn_core::{Conn, CoreError, Info};
use cairn_schema::{EnvironConfig, Life, StateConfig, WorkloadStatus};
use std::fmt;
use std::path::PathBuf;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USER_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Copy of the environment configuration kept next to the store by `init`.
pub const ENVIRON_FILE: &str = "environ.toml";

/// A failed command, classified for the exit code.
#[derive(Debug)]
pub enum CliError {
    /// The request cannot be honoured in the current state.
    User(String),
    Store(String),
    Failure(String),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::User(_) => EXIT_USER_ERROR,
            CliError::Store(_) => EXIT_STORE_ERROR,
            CliError::Failure(_) => EXIT_FAILURE,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::User(msg) | CliError::Failure(msg) => f.write_str(msg),
            CliError::Store(msg) => write!(f, "store error: {msg}"),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(e: CoreError) -> Self {
        if e.is_user_error() {
            CliError::User(e.to_string())
        } else if e.is_store_error() {
            CliError::Store(e.to_string())
        } else {
            CliError::Failure(e.to_string())
        }
    }
}

pub struct Context {
    pub store: PathBuf,
    pub config: StateConfig,
    pub json: bool,
}

impl Context {
    pub fn info(&self) -> Info {
        Info {
            addrs: vec![format!("file:{}", self.store.display())],
            ..Info::default()
        }
    }

    pub fn environ_path(&self) -> PathBuf {
        self.store.join(ENVIRON_FILE)
    }

    pub fn connect(&self) -> Result<Conn, CliError> {
        let path = self.environ_path();
        if !path.exists() {
            return Err(CliError::Failure(format!(
                "no environment at {}; run `cairn init` first",
                self.store.display()
            )));
        }
        let environ = EnvironConfig::load(&path).map_err(|e| {
            CliError::Failure(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(Conn::new(environ, self.info(), self.config.clone(), None)?)
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Failure(format!("JSON serialization failed: {e}")))
}

pub fn colorize_life(life: Life) -> String {
    use console::Style;
    let text = life.as_str();
    match life {
        Life::Alive => Style::new().green().apply_to(text).to_string(),
        Life::Dying => Style::new().yellow().apply_to(text).to_string(),
        Life::Dead => Style::new().red().dim().apply_to(text).to_string(),
    }
}

pub fn colorize_status(status: WorkloadStatus) -> String {
    use console::Style;
    let text = status.as_str();
    match status {
        WorkloadStatus::Active => Style::new().green().apply_to(text).to_string(),
        WorkloadStatus::Error => Style::new().red().bold().apply_to(text).to_string(),
        WorkloadStatus::Blocked => Style::new().yellow().apply_to(text).to_string(),
        WorkloadStatus::Maintenance | WorkloadStatus::Waiting => {
            Style::new().cyan().apply_to(text).to_string()
        }
        WorkloadStatus::Unknown => Style::new().dim().apply_to(text).to_string(),
    }
}
