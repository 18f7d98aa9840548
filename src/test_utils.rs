use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    error::CorralError,
    message::Message,
    process::{ExitOutcome, LaunchContext, Launcher, ProcessHandle, Spawned},
    registry::{Connection, ConnectionId},
    spec::ServiceSpec,
};

/// Global lock for environment variable modifications in tests.
/// All tests that modify environment variables should acquire this lock
/// to prevent race conditions between parallel test executions.
pub static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Polls `predicate` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

type ExitSender = Arc<Mutex<Option<mpsc::Sender<ExitOutcome>>>>;

fn finish(sender: &ExitSender, outcome: ExitOutcome) {
    if let Some(tx) = sender.lock().unwrap().take() {
        let _ = tx.send(outcome);
    }
}

/// Fake process whose exit is driven by the test.
#[derive(Debug)]
pub struct ScriptedProcess {
    pid: u32,
    exit: ExitSender,
    ignore_terminate: bool,
    terminations: Arc<AtomicU32>,
    kills: Arc<AtomicU32>,
}

impl ProcessHandle for ScriptedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&self) -> io::Result<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.ignore_terminate {
            finish(&self.exit, ExitOutcome::signal(libc::SIGTERM));
        }
        Ok(())
    }

    fn kill(&self) -> io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        finish(&self.exit, ExitOutcome::signal(libc::SIGKILL));
        Ok(())
    }
}

#[derive(Default)]
struct Slot {
    launches: u32,
    fail_next: u32,
    ignore_terminate: bool,
    current: Option<ExitSender>,
    terminations: Arc<AtomicU32>,
    kills: Arc<AtomicU32>,
}

/// Launcher that never touches the OS. Tests decide when processes exit.
pub struct ScriptedLauncher {
    slots: Mutex<HashMap<String, Slot>>,
    next_pid: AtomicU32,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(10_000),
        }
    }

    /// Number of successful launches of `name`.
    pub fn launches(&self, name: &str) -> u32 {
        self.slots
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, |slot| slot.launches)
    }

    /// Makes the next `count` launches of `name` fail.
    pub fn fail_next_launches(&self, name: &str, count: u32) {
        self.slots
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .fail_next = count;
    }

    /// Processes of `name` launched from now on ignore SIGTERM.
    pub fn ignore_terminate(&self, name: &str) {
        self.slots
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .ignore_terminate = true;
    }

    /// Ends the current process of `name` with `outcome`.
    pub fn exit(&self, name: &str, outcome: ExitOutcome) {
        let sender = self
            .slots
            .lock()
            .unwrap()
            .get(name)
            .and_then(|slot| slot.current.clone());
        if let Some(sender) = sender {
            finish(&sender, outcome);
        }
    }

    pub fn terminations(&self, name: &str) -> u32 {
        self.slots
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, |slot| slot.terminations.load(Ordering::SeqCst))
    }

    pub fn kills(&self, name: &str) -> u32 {
        self.slots
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, |slot| slot.kills.load(Ordering::SeqCst))
    }
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, spec: &ServiceSpec, _context: &LaunchContext) -> io::Result<Spawned> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(spec.name().to_string()).or_default();
        if slot.fail_next > 0 {
            slot.fail_next -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "scripted launch failure"));
        }

        let (tx, rx) = mpsc::channel();
        let exit: ExitSender = Arc::new(Mutex::new(Some(tx)));
        slot.launches += 1;
        slot.current = Some(Arc::clone(&exit));

        let handle = ScriptedProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit,
            ignore_terminate: slot.ignore_terminate,
            terminations: Arc::clone(&slot.terminations),
            kills: Arc::clone(&slot.kills),
        };
        Ok(Spawned {
            handle: Box::new(handle),
            exit: rx,
        })
    }
}

/// Connection that records what was sent to it.
pub struct RecordingConnection {
    id: ConnectionId,
    sent: Mutex<Vec<Message>>,
    broken: AtomicBool,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self {
            id: ConnectionId::next(),
            sent: Mutex::new(Vec::new()),
            broken: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Makes every later send fail with a broken pipe.
    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Default for RecordingConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: &Message) -> Result<(), CorralError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
