//! Cell identity and output types.
//!
//! Cells are opaque to the engine: an identity token plus string metadata.
//! The engine never touches cell content, it only keys state by [`CellId`]
//! and reads the stable external ID from metadata for logging.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata key holding a cell's stable external ID.
pub const STABLE_ID_KEY: &str = "id";

/// Unique identifier for a cell within a notebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId(pub(crate) u64);

impl CellId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell_{}", self.0)
    }
}

/// A notebook cell as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    id: CellId,
    metadata: HashMap<String, String>,
}

impl Cell {
    /// Create a cell with no metadata.
    pub fn new(id: CellId) -> Self {
        Self {
            id,
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// The stable external ID, falling back to the display form of [`CellId`].
    pub fn stable_id(&self) -> String {
        self.metadata
            .get(STABLE_ID_KEY)
            .filter(|id| !id.is_empty())
            .cloned()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// A named category of rendered result that can be shown or hidden independently.
///
/// Declaration order is the order enabled panels appear in a cell's output list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Structured annotation editor.
    Annotations,
    /// Terminal view of the running process.
    Terminal,
    /// Deployment integration panel.
    Deploy,
    /// GitHub workflow integration panel.
    #[serde(rename = "github")]
    GitHub,
    /// Google Cloud integration panel.
    Gcp,
    /// AWS integration panel.
    Aws,
    /// Dagger pipeline integration panel.
    Dagger,
}

impl OutputKind {
    /// Every kind except [`OutputKind::Terminal`], which is tracked separately.
    pub const PANELS: [OutputKind; 6] = [
        OutputKind::Annotations,
        OutputKind::Deploy,
        OutputKind::GitHub,
        OutputKind::Gcp,
        OutputKind::Aws,
        OutputKind::Dagger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Annotations => "annotations",
            OutputKind::Terminal => "terminal",
            OutputKind::Deploy => "deploy",
            OutputKind::GitHub => "github",
            OutputKind::Gcp => "gcp",
            OutputKind::Aws => "aws",
            OutputKind::Dagger => "dagger",
        }
    }

    pub fn is_panel(&self) -> bool {
        !matches!(self, OutputKind::Terminal)
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payload in a cell's output list.
///
/// `data` is opaque to the engine; only `kind` is inspected, to tell which
/// surface produced the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    /// Surface that owns the item. `None` for pass-through outputs.
    pub kind: Option<OutputKind>,
    /// MIME type of `data`.
    pub mime: String,
    /// Raw payload.
    pub data: Vec<u8>,
}

impl OutputItem {
    /// An item owned by an output surface.
    pub fn new(kind: OutputKind, mime: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: Some(kind),
            mime: mime.into(),
            data: data.into(),
        }
    }

    /// An item the engine appends verbatim without owning it.
    pub fn passthrough(mime: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: None,
            mime: mime.into(),
            data: data.into(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
