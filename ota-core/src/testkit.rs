// Shared fakes for the orchestrator and pipeline tests: a scripted image
// stream, an in-memory flash, a scriptable store and a recording system
// control. All handles are reference-counted so tests can keep inspecting
// state after moving a fake into the orchestrator.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::flash::{FirmwareFlash, FlashError, Partition, WriteSession};
use crate::image::{build_image_head, AppDescriptor};
use crate::orchestrator::Orchestrator;
use crate::pipeline::UpdatePolicy;
use crate::signals::SignalSet;
use crate::store::{PersistentStore, StoreError};
use crate::system::SystemControl;
use crate::transport::{FirmwareFetcher, ImageStream, StreamError, StreamRead};

// ---------------------------------------------------------------- transport

pub enum ScriptEvent {
    Data(Vec<u8>),
    Pending,
    Closed,
    Error(StreamError),
}

pub struct ScriptedStream {
    events: VecDeque<ScriptEvent>,
    complete: bool,
}

impl ScriptedStream {
    pub fn new(events: Vec<ScriptEvent>, complete: bool) -> Self {
        Self { events: events.into(), complete }
    }
}

impl ImageStream for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<StreamRead, StreamError> {
        match self.events.pop_front() {
            None | Some(ScriptEvent::Closed) => Ok(StreamRead::Closed),
            Some(ScriptEvent::Pending) => Ok(StreamRead::Pending),
            Some(ScriptEvent::Error(err)) => Err(err),
            Some(ScriptEvent::Data(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(StreamRead::Data(bytes.len()))
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[derive(Clone, Default)]
pub struct ScriptedFetcher {
    stream: Rc<RefCell<Option<ScriptedStream>>>,
    pub opens: Rc<Cell<u32>>,
    pub connect_fails: Rc<Cell<bool>>,
}

impl ScriptedFetcher {
    pub fn with_stream(stream: ScriptedStream) -> Self {
        let fetcher = Self::default();
        fetcher.queue_stream(stream);
        fetcher
    }

    pub fn failing_connect() -> Self {
        let fetcher = Self::default();
        fetcher.connect_fails.set(true);
        fetcher
    }

    pub fn queue_stream(&self, stream: ScriptedStream) {
        *self.stream.borrow_mut() = Some(stream);
    }
}

impl FirmwareFetcher for ScriptedFetcher {
    type Stream = ScriptedStream;

    fn open(&mut self) -> Result<ScriptedStream, StreamError> {
        self.opens.set(self.opens.get() + 1);
        if self.connect_fails.get() {
            return Err(StreamError::Connect("connection refused".into()));
        }
        self.stream
            .borrow_mut()
            .take()
            .ok_or_else(|| StreamError::Connect("no scripted stream queued".into()))
    }
}

// ------------------------------------------------------------------- images

pub fn image_bytes(version: &str, total: usize) -> Vec<u8> {
    let head = build_image_head(version, "ota-agent");
    if total <= head.len() {
        return head[..total].to_vec();
    }
    let mut bytes = head;
    bytes.resize(total, 0xA5);
    bytes
}

pub fn image_chunks(version: &str, total: usize, chunk: usize) -> Vec<ScriptEvent> {
    image_bytes(version, total)
        .chunks(chunk)
        .map(|c| ScriptEvent::Data(c.to_vec()))
        .collect()
}

// -------------------------------------------------------------------- flash

pub struct FlashState {
    pub boot: Partition,
    pub running: Partition,
    pub update: Partition,
    pub running_version: Option<String>,
    pub invalid_version: Option<String>,
    pub written: Vec<u8>,
    pub session_open: bool,
    pub writes: u32,
    pub aborts: u32,
    pub commits: u32,
    pub cleared_invalid: u32,
    pub fail_begin: bool,
    /// Fail the n-th write call (0-based).
    pub fail_write_at: Option<u32>,
    pub fail_commit: bool,
}

#[derive(Clone)]
pub struct MemFlash {
    pub state: Rc<RefCell<FlashState>>,
}

impl MemFlash {
    pub fn with_running_version(version: &str) -> Self {
        let running = Partition::new("ota_0", 0x10000, 0x180000);
        let update = Partition::new("ota_1", 0x190000, 0x180000);
        Self {
            state: Rc::new(RefCell::new(FlashState {
                boot: running.clone(),
                running,
                update,
                running_version: Some(version.into()),
                invalid_version: None,
                written: Vec::new(),
                session_open: false,
                writes: 0,
                aborts: 0,
                commits: 0,
                cleared_invalid: 0,
                fail_begin: false,
                fail_write_at: None,
                fail_commit: false,
            })),
        }
    }
}

fn descriptor(version: &str) -> AppDescriptor {
    AppDescriptor {
        version: version.into(),
        project_name: "ota-agent".into(),
    }
}

pub struct MemSession {
    state: Rc<RefCell<FlashState>>,
}

impl WriteSession for MemSession {
    fn write(&mut self, chunk: &[u8]) -> Result<(), FlashError> {
        let mut state = self.state.borrow_mut();
        if state.fail_write_at == Some(state.writes) {
            return Err(FlashError::WriteFailed);
        }
        state.writes += 1;
        state.written.extend_from_slice(chunk);
        Ok(())
    }

    fn commit(self) -> Result<(), FlashError> {
        let mut state = self.state.borrow_mut();
        state.session_open = false;
        if state.fail_commit {
            return Err(FlashError::BootTargetFailed);
        }
        state.commits += 1;
        state.boot = state.update.clone();
        Ok(())
    }

    fn abort(self) {
        let mut state = self.state.borrow_mut();
        state.session_open = false;
        state.aborts += 1;
        state.written.clear();
    }
}

impl FirmwareFlash for MemFlash {
    type Session = MemSession;

    fn boot_partition(&self) -> Result<Partition, FlashError> {
        Ok(self.state.borrow().boot.clone())
    }

    fn running_partition(&self) -> Result<Partition, FlashError> {
        Ok(self.state.borrow().running.clone())
    }

    fn next_update_partition(&self) -> Result<Partition, FlashError> {
        Ok(self.state.borrow().update.clone())
    }

    fn factory_partition(&self) -> Result<Option<Partition>, FlashError> {
        Ok(Some(Partition::new("factory", 0x400000, 0x180000)))
    }

    fn app_descriptor(&self, part: &Partition) -> Result<Option<AppDescriptor>, FlashError> {
        let state = self.state.borrow();
        let version = match part.label.as_str() {
            "ota_0" => state.running_version.clone(),
            "ota_1" => state.invalid_version.clone(),
            _ => None,
        };
        Ok(version.map(|v| descriptor(&v)))
    }

    fn last_invalid_partition(&self) -> Result<Option<Partition>, FlashError> {
        let state = self.state.borrow();
        Ok(state.invalid_version.as_ref().map(|_| state.update.clone()))
    }

    fn clear_last_invalid(&mut self) -> Result<(), FlashError> {
        let mut state = self.state.borrow_mut();
        state.cleared_invalid += 1;
        state.invalid_version = None;
        Ok(())
    }

    fn partition_digest(&self, _part: &Partition) -> Result<[u8; 32], FlashError> {
        Ok([0x42; 32])
    }

    fn region_digest(&self, _address: u32, _size: u32) -> Result<[u8; 32], FlashError> {
        Ok([0; 32])
    }

    fn begin_update(&mut self, _target: &Partition) -> Result<MemSession, FlashError> {
        let mut state = self.state.borrow_mut();
        if state.fail_begin {
            return Err(FlashError::BeginFailed);
        }
        state.session_open = true;
        state.writes = 0;
        Ok(MemSession { state: self.state.clone() })
    }
}

// -------------------------------------------------------------------- store

#[derive(Clone, Default)]
pub struct MemStore {
    init_script: Rc<RefCell<VecDeque<Result<(), StoreError>>>>,
    pub inits: Rc<Cell<u32>>,
    pub erases: Rc<Cell<u32>>,
    pub erase_fails: Rc<Cell<bool>>,
}

impl MemStore {
    pub fn fail_first_init_with_mismatch(&self) {
        self.init_script
            .borrow_mut()
            .push_back(Err(StoreError::LayoutMismatch));
    }

    pub fn fail_first_init_hard(&self) {
        self.init_script
            .borrow_mut()
            .push_back(Err(StoreError::Failed("store unreachable".into())));
    }
}

impl PersistentStore for MemStore {
    fn init(&mut self) -> Result<(), StoreError> {
        self.inits.set(self.inits.get() + 1);
        self.init_script.borrow_mut().pop_front().unwrap_or(Ok(()))
    }

    fn erase(&mut self) -> Result<(), StoreError> {
        self.erases.set(self.erases.get() + 1);
        if self.erase_fails.get() {
            Err(StoreError::Failed("erase failed".into()))
        } else {
            Ok(())
        }
    }
}

// ------------------------------------------------------------------- system

#[derive(Clone, Default)]
pub struct RecordingSystem {
    pub sleeps: Rc<Cell<u32>>,
    pub restarts: Rc<Cell<u32>>,
    pub idles: Rc<Cell<u32>>,
}

impl SystemControl for RecordingSystem {
    fn sleep(&self, _duration: Duration) {
        self.sleeps.set(self.sleeps.get() + 1);
    }

    fn restart(&self) {
        self.restarts.set(self.restarts.get() + 1);
    }

    fn idle_until_reset(&self) {
        self.idles.set(self.idles.get() + 1);
    }
}

// ----------------------------------------------------------------- fixture

pub struct Fixture {
    pub signals: Arc<SignalSet>,
    pub fetcher: ScriptedFetcher,
    pub flash_state: Rc<RefCell<FlashState>>,
    pub store: MemStore,
    pub system: RecordingSystem,
    pub orchestrator: Orchestrator<ScriptedFetcher, MemFlash, MemStore, RecordingSystem>,
}

pub fn fixture() -> Fixture {
    let signals = Arc::new(SignalSet::new());
    let fetcher = ScriptedFetcher::default();
    let flash = MemFlash::with_running_version("0.3.2");
    let flash_state = flash.state.clone();
    let store = MemStore::default();
    let system = RecordingSystem::default();
    let orchestrator = Orchestrator::new(
        signals.clone(),
        fetcher.clone(),
        flash,
        store.clone(),
        system.clone(),
        UpdatePolicy::default(),
    );
    Fixture {
        signals,
        fetcher,
        flash_state,
        store,
        system,
        orchestrator,
    }
}
