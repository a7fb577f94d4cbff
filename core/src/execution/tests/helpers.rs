//! Test harness: an engine with the standard steps and an owner in a temp dir

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineBuilder, Pickle, PickleResolver, StepContext, StepDescriptor, StepExecution};
use crate::error::{EngineResult, Failure};
use crate::execution::{ExecutionRecord, FlowExecution, StartOptions};
use crate::flow::{FlowNode, FlowNodeStorage, FlowResult, NodeAction, NodeId, StorageKind};
use crate::owner::{DirectoryOwner, FlowExecutionOwner, LogSink, TaskListener};
use crate::script::Val;
use crate::steps::{standard_registry, SignalBoard};

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub dir: TempDir,
    pub board: SignalBoard,
    pub config: EngineConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        crate::logging::init_for_tests();
        Self {
            dir: TempDir::new().expect("temp dir"),
            board: SignalBoard::new(),
            config,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("run")
    }

    pub fn builder(&self) -> EngineBuilder {
        Engine::builder(self.config.clone())
            .steps(standard_registry(&self.board))
            .step(Connect)
            .step(UseConnection)
    }

    pub fn engine(&self) -> Engine {
        self.builder().build()
    }

    pub fn owner(&self) -> Arc<DirectoryOwner> {
        Arc::new(DirectoryOwner::new("Script1 #1", self.root()).expect("owner"))
    }

    pub fn start(&self, script: &str) -> (Arc<FlowExecution>, Arc<LogSink>) {
        self.start_with(self.engine(), script, StartOptions::default())
    }

    pub fn start_with(
        &self,
        engine: Engine,
        script: &str,
        options: StartOptions,
    ) -> (Arc<FlowExecution>, Arc<LogSink>) {
        let owner = self.owner();
        let log = owner.log();
        let execution = FlowExecution::create(engine, owner, script, options).expect("create");
        execution.start().expect("start");
        (execution, log)
    }

    /// Simulate a restart: a fresh signal board, engine and owner over the same directory
    pub async fn reload(&mut self) -> (Arc<FlowExecution>, Arc<LogSink>) {
        self.board = SignalBoard::new();
        let owner = self.owner();
        let log = owner.log();
        let execution = FlowExecution::load(self.engine(), owner)
            .await
            .expect("load");
        (execution, log)
    }

    pub async fn wait_for_signal(&self, name: &str) {
        assert!(
            self.board.wait_for_waiter(name, WAIT).await,
            "nobody waited for '{}'",
            name
        );
    }
}

pub async fn finish(execution: &Arc<FlowExecution>) -> FlowResult {
    tokio::time::timeout(WAIT, execution.wait_for_completion())
        .await
        .expect("execution should finish")
}

pub fn node_named(execution: &FlowExecution, display_name: &str) -> FlowNode {
    execution
        .nodes()
        .unwrap()
        .into_iter()
        .find(|n| n.display_name.as_deref() == Some(display_name))
        .unwrap_or_else(|| panic!("no node named {}", display_name))
}

// ============================================================================
// Handle Steps
// ============================================================================

/// `connect(key)` returns a handle bound to a live object
pub struct Connect;

struct ConnectExecution {
    key: String,
}

impl StepDescriptor for Connect {
    fn function_name(&self) -> &str {
        "connect"
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        Ok(Box::new(ConnectExecution {
            key: args.first().map(|a| a.to_string()).unwrap_or_default(),
        }))
    }
}

impl StepExecution for ConnectExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        let pickle = Pickle::new("conn", self.key.clone());
        ctx.bind_live_object(pickle.clone(), Val::from(format!("live-{}", self.key)));
        ctx.on_success(Val::Handle(pickle));
        Ok(true)
    }
}

/// `use_connection(handle)` returns the live object behind the handle
pub struct UseConnection;

struct UseConnectionExecution {
    handle: Val,
}

impl StepDescriptor for UseConnection {
    fn function_name(&self) -> &str {
        "use_connection"
    }

    fn create(&self, args: &[Val]) -> Result<Box<dyn StepExecution>, Failure> {
        Ok(Box::new(UseConnectionExecution {
            handle: args.first().cloned().unwrap_or(Val::Null),
        }))
    }
}

impl StepExecution for UseConnectionExecution {
    fn start(&mut self, ctx: &StepContext) -> Result<bool, Failure> {
        let Val::Handle(pickle) = &self.handle else {
            return Err(Failure::internal("not a handle"));
        };
        let live = ctx
            .live_object(pickle)
            .ok_or_else(|| Failure::internal(format!("{} is not bound", pickle)))?;
        ctx.on_success(live);
        Ok(true)
    }
}

pub struct PrefixResolver(pub &'static str);

#[async_trait]
impl PickleResolver for PrefixResolver {
    async fn resolve(&self, pickle: &Pickle) -> anyhow::Result<Val> {
        Ok(Val::from(format!("{}-{}", self.0, pickle.key)))
    }
}

/// Never resolves
pub struct StuckResolver;

#[async_trait]
impl PickleResolver for StuckResolver {
    async fn resolve(&self, _pickle: &Pickle) -> anyhow::Result<Val> {
        std::future::pending::<()>().await;
        unreachable!()
    }
}

// ============================================================================
// Recording Owner
// ============================================================================

/// Owner that records flushes and saves in order
pub struct RecordingOwner {
    pub inner: DirectoryOwner,
    pub events: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingOwner {
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: DirectoryOwner::new("recorded", root).expect("owner"),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl FlowExecutionOwner for RecordingOwner {
    fn executable(&self) -> String {
        self.inner.executable()
    }

    fn root_dir(&self) -> PathBuf {
        self.inner.root_dir()
    }

    fn listener(&self) -> Arc<dyn TaskListener> {
        self.inner.listener()
    }

    fn save(&self, record: &ExecutionRecord) -> EngineResult<()> {
        self.events.lock().push("save");
        self.inner.save(record)
    }

    fn load(&self) -> EngineResult<ExecutionRecord> {
        self.inner.load()
    }

    fn save_program(&self, program: &serde_json::Value) -> EngineResult<()> {
        self.events.lock().push("save_program");
        self.inner.save_program(program)
    }

    fn open_storage(&self, kind: StorageKind) -> EngineResult<Box<dyn FlowNodeStorage>> {
        Ok(Box::new(RecordingStorage {
            inner: self.inner.open_storage(kind)?,
            events: Arc::clone(&self.events),
        }))
    }
}

struct RecordingStorage {
    inner: Box<dyn FlowNodeStorage>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl FlowNodeStorage for RecordingStorage {
    fn get(&self, id: NodeId) -> EngineResult<Option<FlowNode>> {
        self.inner.get(id)
    }

    fn store(&mut self, node: &FlowNode, defer_action_write: bool) -> EngineResult<()> {
        self.inner.store(node, defer_action_write)
    }

    fn flush(&mut self) -> EngineResult<()> {
        self.events.lock().push("flush");
        self.inner.flush()
    }

    fn load_actions(&self, id: NodeId) -> EngineResult<Vec<NodeAction>> {
        self.inner.load_actions(id)
    }

    fn save_actions(&mut self, id: NodeId, actions: Vec<NodeAction>) -> EngineResult<()> {
        self.inner.save_actions(id, actions)
    }

    fn autopersist(&mut self, id: NodeId) -> EngineResult<()> {
        self.inner.autopersist(id)
    }

    fn nodes(&self) -> EngineResult<Vec<FlowNode>> {
        self.inner.nodes()
    }

    fn kind(&self) -> StorageKind {
        self.inner.kind()
    }
}
