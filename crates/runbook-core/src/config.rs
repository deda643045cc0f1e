//! Coordinator configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cell::OutputKind;
use crate::error::{Error, Result};
use crate::terminal::TerminalKind;

/// Settings shared by every coordinator in a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Output kinds tracked in each coordinator's enabled-output map.
    pub panels: Vec<OutputKind>,
    /// How long `create_execution` waits for the previous run to finish.
    /// `None` waits forever.
    pub finish_timeout_ms: Option<u64>,
    /// Terminal buffer settings.
    pub terminal: TerminalConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            panels: OutputKind::PANELS.to_vec(),
            finish_timeout_ms: None,
            terminal: TerminalConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_json_str(&source)
    }

    pub fn finish_timeout(&self) -> Option<Duration> {
        self.finish_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_finish_timeout(mut self, timeout: Duration) -> Self {
        self.finish_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.panels.contains(&OutputKind::Terminal) {
            return Err(Error::Config(
                "terminal is not a panel; configure it under `terminal`".to_string(),
            ));
        }
        if self.terminal.rows == 0 || self.terminal.cols == 0 {
            return Err(Error::Config(format!(
                "terminal size must be non-zero, got {}x{}",
                self.terminal.rows, self.terminal.cols
            )));
        }
        Ok(())
    }
}

/// Terminal buffer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Strategy attached by `CoordinatorRegistry::register_cell`.
    pub default_kind: TerminalKind,
    /// Whether `register_cell` attaches a terminal at all.
    pub attach_on_register: bool,
    pub rows: u16,
    pub cols: u16,
    /// Scrollback lines kept by the interactive screen.
    pub scrollback: usize,
    /// Cap on bytes kept by the local buffer.
    pub local_max_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_kind: TerminalKind::Interactive,
            attach_on_register: false,
            rows: 24,
            cols: 80,
            scrollback: 1000,
            local_max_bytes: 1024 * 1024,
        }
    }
}
