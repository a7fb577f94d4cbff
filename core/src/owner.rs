//! The record handle that owns a flow execution
//!
//! The engine never decides where things live: it asks its owner for the root
//! directory, the log sink, and for saving/loading the execution record and the
//! serialized program.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::execution::ExecutionRecord;
use crate::flow::storage::{read_json, write_json_atomic};
use crate::flow::{BulkNodeStorage, FlowNodeStorage, NodeFileStorage, StorageKind};

/* ===================== Listener ===================== */

/// Append-only log sink for an execution
pub trait TaskListener: Send + Sync {
    fn log(&self, line: &str);
}

/// Listener that drops everything
pub struct NullListener;

impl TaskListener for NullListener {
    fn log(&self, _line: &str) {}
}

/// Log file that also keeps its lines in memory
pub struct LogSink {
    file: Mutex<Option<File>>,
    lines: Mutex<Vec<String>>,
}

impl LogSink {
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(Some(file)),
            lines: Mutex::new(Vec::new()),
        })
    }

    /// In-memory only
    pub fn memory() -> Self {
        Self {
            file: Mutex::new(None),
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

impl TaskListener for LogSink {
    fn log(&self, line: &str) {
        if let Some(file) = self.file.lock().as_mut() {
            if let Err(err) = writeln!(file, "{}", line) {
                tracing::warn!(error = %err, "Failed to write to execution log");
            }
        }
        self.lines.lock().push(line.to_string());
    }
}

/* ===================== Owner ===================== */

pub trait FlowExecutionOwner: Send + Sync {
    /// Name of the thing being executed
    fn executable(&self) -> String;

    fn root_dir(&self) -> PathBuf;

    fn listener(&self) -> Arc<dyn TaskListener>;

    fn save(&self, record: &ExecutionRecord) -> EngineResult<()>;

    fn load(&self) -> EngineResult<ExecutionRecord>;

    fn save_program(&self, program: &serde_json::Value) -> EngineResult<()> {
        write_json_atomic(&self.root_dir().join("program.json"), program)
    }

    fn load_program(&self) -> EngineResult<serde_json::Value> {
        let path = self.root_dir().join("program.json");
        read_json(&path)?.ok_or_else(|| {
            EngineError::Storage(format!("no saved program at {}", path.display()))
        })
    }

    fn open_storage(&self, kind: StorageKind) -> EngineResult<Box<dyn FlowNodeStorage>> {
        let root = self.root_dir();
        Ok(match kind {
            StorageKind::PerNode => Box::new(NodeFileStorage::open(root.join("nodes"))?),
            StorageKind::Bulk => Box::new(BulkNodeStorage::open(root.join("nodes.json"))?),
        })
    }

    /// Empty bulk storage: the migration target on completion, and the
    /// replacement when the recorded history cannot be read
    fn fresh_bulk_storage(&self) -> EngineResult<Box<dyn FlowNodeStorage>> {
        Ok(Box::new(BulkNodeStorage::fresh(
            self.root_dir().join("nodes.json"),
        )))
    }
}

/// Owner rooted at a directory: `execution.json`, `program.json`, `log`, history
pub struct DirectoryOwner {
    name: String,
    root: PathBuf,
    log: Arc<LogSink>,
}

impl DirectoryOwner {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> EngineResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let log = Arc::new(LogSink::open(&root.join("log"))?);
        Ok(Self {
            name: name.into(),
            root,
            log,
        })
    }

    pub fn log(&self) -> Arc<LogSink> {
        Arc::clone(&self.log)
    }
}

impl FlowExecutionOwner for DirectoryOwner {
    fn executable(&self) -> String {
        self.name.clone()
    }

    fn root_dir(&self) -> PathBuf {
        self.root.clone()
    }

    fn listener(&self) -> Arc<dyn TaskListener> {
        self.log.clone()
    }

    fn save(&self, record: &ExecutionRecord) -> EngineResult<()> {
        write_json_atomic(&self.root.join("execution.json"), record)
    }

    fn load(&self) -> EngineResult<ExecutionRecord> {
        let path = self.root.join("execution.json");
        read_json(&path)?.ok_or_else(|| {
            EngineError::Storage(format!("no execution record at {}", path.display()))
        })
    }
}
