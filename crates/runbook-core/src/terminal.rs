//! Terminal state strategies.
//!
//! A cell's terminal surface buffers the running process's byte stream and
//! serializes it into the cell's output list. Two interchangeable variants:
//!
//! - [`InteractiveBuffer`] - a virtual screen (`vt100`) that interprets
//!   escape sequences, so the serialized form restores the view as the user
//!   saw it.
//! - [`LocalBuffer`] - a passive, size-capped byte log.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cell::{OutputItem, OutputKind};
use crate::config::TerminalConfig;

/// Which terminal strategy a cell uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    #[default]
    Interactive,
    Local,
}

impl TerminalKind {
    /// MIME type of the serialized terminal payload.
    pub fn mime(&self) -> &'static str {
        match self {
            TerminalKind::Interactive => "application/vnd.runbook.terminal+interactive",
            TerminalKind::Local => "application/vnd.runbook.terminal+local",
        }
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalKind::Interactive => f.write_str("interactive"),
            TerminalKind::Local => f.write_str("local"),
        }
    }
}

/// Live terminal backed by a virtual screen.
pub struct InteractiveBuffer {
    parser: vt100::Parser,
}

impl InteractiveBuffer {
    pub fn new(rows: u16, cols: u16, scrollback: usize) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, scrollback),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.parser.process(data);
    }

    /// Screen contents with the escape sequences needed to redraw them.
    pub fn serialize(&self) -> Vec<u8> {
        self.parser.screen().contents_formatted()
    }

    /// Visible text without formatting.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }
}

impl fmt::Debug for InteractiveBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (rows, cols) = self.parser.screen().size();
        f.debug_struct("InteractiveBuffer")
            .field("rows", &rows)
            .field("cols", &cols)
            .finish()
    }
}

/// Passive byte log that keeps the newest `max_bytes`.
#[derive(Debug, Clone)]
pub struct LocalBuffer {
    data: Vec<u8>,
    max_bytes: usize,
}

impl LocalBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: Vec::new(),
            max_bytes,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
        if self.data.len() > self.max_bytes {
            let excess = self.data.len() - self.max_bytes;
            self.data.drain(..excess);
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A cell's terminal state, one of the two strategies.
#[derive(Debug)]
pub enum TerminalBuffer {
    Interactive(InteractiveBuffer),
    Local(LocalBuffer),
}

impl TerminalBuffer {
    /// Build a buffer of `kind` sized from `config`.
    pub fn from_config(kind: TerminalKind, config: &TerminalConfig) -> Self {
        match kind {
            TerminalKind::Interactive => TerminalBuffer::Interactive(InteractiveBuffer::new(
                config.rows,
                config.cols,
                config.scrollback,
            )),
            TerminalKind::Local => TerminalBuffer::Local(LocalBuffer::new(config.local_max_bytes)),
        }
    }

    pub fn output_kind(&self) -> TerminalKind {
        match self {
            TerminalBuffer::Interactive(_) => TerminalKind::Interactive,
            TerminalBuffer::Local(_) => TerminalKind::Local,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        match self {
            TerminalBuffer::Interactive(buffer) => buffer.write(data),
            TerminalBuffer::Local(buffer) => buffer.write(data),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            TerminalBuffer::Interactive(buffer) => buffer.serialize(),
            TerminalBuffer::Local(buffer) => buffer.serialize(),
        }
    }

    /// The terminal's entry in the cell's output list.
    pub fn to_output(&self) -> OutputItem {
        OutputItem::new(
            OutputKind::Terminal,
            self.output_kind().mime(),
            self.serialize(),
        )
    }
}
