//! Out-of-process guest function execution.
//!
//! One background thread owns a loopback listener and every worker socket. Guest
//! workers connect, announce their Lang, and then exchange newline-delimited JSON
//! messages. At most one job is in flight at a time; the interpreter thread
//! blocks on it and answers `exe_ditlang` callbacks between rounds.

use std::{
    collections::HashSet,
    fs, io,
    net::SocketAddr,
    path::{Path, PathBuf},
    process::{Child, Command},
    sync::mpsc as std_mpsc,
    thread,
    time::Duration,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, error, trace, warn};

use crate::diagnostics::{Diagnostic, DiagnosticKind, DitError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    CallFunc,
    DitlangCallback,
    ExeDitlang,
    FinishFunc,
    Crash,
    Heart,
}

/// The single unit of work shared by the interpreter and the daemon thread.
/// Serializes to exactly the message a worker receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuestDaemonJob {
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub lang_name: String,
    pub func_name: String,
    pub func_path: PathBuf,
    pub result: serde_json::Value,
    #[serde(skip)]
    pub crashed: bool,
    #[serde(skip)]
    pub active: bool,
}

impl GuestDaemonJob {
    pub fn call(lang_name: &str, func_name: &str, func_path: &Path) -> Self {
        Self {
            kind: JobKind::CallFunc,
            lang_name: lang_name.to_string(),
            func_name: func_name.to_string(),
            func_path: func_path.to_path_buf(),
            result: serde_json::Value::Null,
            crashed: false,
            active: false,
        }
    }

    /// Answers an `exe_ditlang` request with the callback's value.
    pub fn callback(mut self, result: serde_json::Value) -> Self {
        self.kind = JobKind::DitlangCallback;
        self.result = result;
        self.active = false;
        self
    }

    fn settle(&mut self, kind: JobKind, result: serde_json::Value) {
        self.kind = kind;
        self.result = result;
        self.active = false;
        self.crashed = kind == JobKind::Crash;
    }
}

/// Messages a worker sends after connecting.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Connect {
        lang: String,
    },
    Heart {
        #[serde(default)]
        result: serde_json::Value,
    },
    Crash {
        #[serde(default)]
        result: serde_json::Value,
    },
    ExeDitlang {
        #[serde(default)]
        result: serde_json::Value,
    },
    FinishFunc {
        #[serde(default)]
        result: serde_json::Value,
    },
}

/// What the launcher needs to start a worker for one Lang.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub lang_name: String,
    pub executable: String,
    pub extension: String,
    pub driver_source: String,
}

pub trait WorkerProcess {
    /// True once the worker is gone, whether or not it ever connected.
    fn has_exited(&mut self) -> io::Result<bool>;
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts worker processes. Swapped out in tests for in-process workers.
pub trait WorkerLauncher {
    fn launch(
        &self,
        spec: &LaunchSpec,
        port: u16,
        tmp_dir: &Path,
    ) -> io::Result<Box<dyn WorkerProcess>>;
}

/// Writes the driver into the temp directory and runs `[exe, driver, port, lang]`.
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        spec: &LaunchSpec,
        port: u16,
        tmp_dir: &Path,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        fs::create_dir_all(tmp_dir)?;
        let driver = tmp_dir.join(format!(
            "{}_guest_daemon.{}",
            spec.lang_name, spec.extension
        ));
        fs::write(&driver, &spec.driver_source)?;
        debug!(lang = %spec.lang_name, executable = %spec.executable, "launching guest worker");
        let child = Command::new(&spec.executable)
            .arg(&driver)
            .arg(port.to_string())
            .arg(&spec.lang_name)
            .spawn()?;
        Ok(Box::new(child))
    }
}

impl WorkerProcess for Child {
    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.try_wait()?.is_some())
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        self.kill()?;
        self.wait().map(|_| ())
    }
}

/// How often a blocked submitter checks whether its worker process died.
const EXIT_POLL: Duration = Duration::from_millis(100);

/// The event loop's answer to one submission.
enum Settled {
    Done(GuestDaemonJob),
    /// The Lang's worker went away before it saw the job. Safe to resubmit.
    Lost(GuestDaemonJob),
}

type Reply = std_mpsc::Sender<std::result::Result<Settled, Diagnostic>>;

enum Request {
    Submit { job: GuestDaemonJob, reply: Reply },
    /// The worker process for `lang` has exited.
    WorkerExited { lang: String },
    Shutdown,
}

/// Interpreter-side handle to the daemon thread and the workers it launched.
pub struct DaemonHandle {
    port: u16,
    requests: mpsc::UnboundedSender<Request>,
    thread: Option<thread::JoinHandle<std::result::Result<(), Diagnostic>>>,
    launcher: Box<dyn WorkerLauncher>,
    workers: IndexMap<String, Box<dyn WorkerProcess>>,
    tmp_dir: PathBuf,
}

impl DaemonHandle {
    pub fn spawn(launcher: Box<dyn WorkerLauncher>, tmp_dir: PathBuf) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (requests, request_rx) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name("dit-guest-daemon".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return Ok(());
                    }
                };
                runtime.block_on(event_loop(ready_tx, request_rx))
            })?;
        let port = match ready_rx.recv() {
            Ok(Ok(port)) => port,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                return Err(DitError::from(Diagnostic::critical(
                    "Guest daemon exited before it started listening",
                )))
            }
        };
        debug!(port, "guest daemon listening");
        Ok(Self {
            port,
            requests,
            thread: Some(thread),
            launcher,
            workers: IndexMap::new(),
            tmp_dir,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hands `job` to the worker for its Lang and blocks until the worker
    /// finishes, crashes, or asks for an `exe_ditlang` callback. A worker that
    /// disappeared before taking the job is relaunched once.
    pub fn run_job(&mut self, mut job: GuestDaemonJob, spec: &LaunchSpec) -> Result<GuestDaemonJob> {
        let mut relaunched = false;
        loop {
            self.ensure_worker(&job.lang_name, spec)?;
            job.active = false;
            job.crashed = false;
            trace!(kind = ?job.kind, func = %job.func_name, "submitting guest job");
            match self.submit(job)? {
                Settled::Done(finished) => return settled(finished),
                Settled::Lost(lost) => {
                    self.retire(&lost.lang_name);
                    if relaunched || lost.kind != JobKind::CallFunc {
                        return Err(DitError::from(Diagnostic::new(
                            DiagnosticKind::Code,
                            format!(
                                "Guest function '{}' crashed:\n{} worker disconnected before answering",
                                lost.func_name, lost.lang_name
                            ),
                        )));
                    }
                    debug!(lang = %lost.lang_name, "guest worker gone, relaunching");
                    relaunched = true;
                    job = lost;
                }
            }
        }
    }

    fn ensure_worker(&mut self, lang: &str, spec: &LaunchSpec) -> Result<()> {
        if self.workers.contains_key(lang) {
            return Ok(());
        }
        let worker = self
            .launcher
            .launch(spec, self.port, &self.tmp_dir)
            .map_err(|err| {
                Diagnostic::critical(format!(
                    "Could not launch '{}' for Lang '{}': {err}",
                    spec.executable, spec.lang_name
                ))
            })?;
        self.workers.insert(lang.to_string(), worker);
        Ok(())
    }

    /// Forgets a worker so the next job for its Lang launches a fresh one.
    fn retire(&mut self, lang: &str) {
        if let Some(mut worker) = self.workers.shift_remove(lang) {
            if let Err(err) = worker.terminate() {
                warn!(%lang, %err, "could not stop guest worker");
            }
        }
    }

    fn submit(&mut self, job: GuestDaemonJob) -> Result<Settled> {
        let lang = job.lang_name.clone();
        let (reply, answer) = std_mpsc::channel();
        self.requests
            .send(Request::Submit { job, reply })
            .map_err(|_| Diagnostic::critical("Guest daemon is not running"))?;
        let mut reported = false;
        loop {
            match answer.recv_timeout(EXIT_POLL) {
                Ok(settled) => return Ok(settled?),
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    if reported {
                        continue;
                    }
                    let exited = match self.workers.get_mut(&lang) {
                        Some(worker) => worker.has_exited()?,
                        None => false,
                    };
                    if exited {
                        debug!(%lang, "guest worker process exited");
                        reported = true;
                        let _ = self.requests.send(Request::WorkerExited { lang: lang.clone() });
                    }
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(DitError::from(Diagnostic::critical(
                        "Guest daemon stopped while a job was in flight",
                    )))
                }
            }
        }
    }

    /// Stops the event loop and every worker. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.requests.send(Request::Shutdown);
        let outcome = thread
            .join()
            .map_err(|_| Diagnostic::critical("Guest daemon thread panicked"))?;
        for (lang, mut worker) in self.workers.drain(..) {
            if let Err(err) = worker.terminate() {
                warn!(%lang, %err, "could not stop guest worker");
            }
        }
        outcome.map_err(DitError::from)
    }
}

fn settled(finished: GuestDaemonJob) -> Result<GuestDaemonJob> {
    if !finished.crashed {
        return Ok(finished);
    }
    let text = match &finished.result {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    Err(DitError::from(Diagnostic::new(
        DiagnosticKind::Code,
        format!(
            "Guest function '{}' crashed:\n{}",
            finished.func_name,
            text.trim_end()
        ),
    )))
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(%err, "guest daemon shutdown failed");
        }
    }
}

struct Connection {
    lang: String,
    addr: SocketAddr,
    writer: OwnedWriteHalf,
}

struct Pending {
    job: GuestDaemonJob,
    reply: Reply,
    /// The worker has said anything since the job was dispatched.
    heard: bool,
}

enum Event {
    Connected {
        key: usize,
        lang: String,
        addr: SocketAddr,
        writer: OwnedWriteHalf,
    },
    Message {
        key: usize,
        message: WorkerMessage,
    },
    Malformed {
        key: usize,
        line: String,
    },
    Closed {
        key: usize,
    },
}

#[derive(Default)]
struct LoopState {
    connections: IndexMap<usize, Connection>,
    readers: IndexMap<usize, JoinHandle<()>>,
    job: Option<Pending>,
    /// Langs whose worker connected once and has since disconnected.
    lost: HashSet<String>,
    next_key: usize,
}

async fn event_loop(
    ready: std_mpsc::Sender<io::Result<u16>>,
    mut requests: mpsc::UnboundedReceiver<Request>,
) -> std::result::Result<(), Diagnostic> {
    let listener = match TcpListener::bind(("127.0.0.1", 0)).await {
        Ok(listener) => listener,
        Err(err) => {
            let _ = ready.send(Err(err));
            return Ok(());
        }
    };
    match listener.local_addr() {
        Ok(addr) => {
            let _ = ready.send(Ok(addr.port()));
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return Ok(());
        }
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut state = LoopState::default();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => state.accept(stream, addr, events_tx.clone()),
                Err(err) => warn!(%err, "guest daemon accept failed"),
            },
            Some(event) = events.recv() => state.handle(event),
            request = requests.recv() => match request {
                Some(Request::Submit { job, reply }) => state.submit(job, reply),
                Some(Request::WorkerExited { lang }) => state.worker_exited(&lang),
                Some(Request::Shutdown) | None => break,
            },
        }
        state.dispatch().await;
    }
    state.teardown()
}

impl LoopState {
    fn accept(&mut self, stream: TcpStream, addr: SocketAddr, events: mpsc::UnboundedSender<Event>) {
        let key = self.next_key;
        self.next_key += 1;
        trace!(%addr, key, "accepted guest connection");
        let reader = tokio::spawn(read_worker(key, stream, addr, events));
        self.readers.insert(key, reader);
    }

    fn submit(&mut self, job: GuestDaemonJob, reply: Reply) {
        if self.job.is_some() {
            let _ = reply.send(Err(Diagnostic::critical(
                "A guest job is already in flight",
            )));
            return;
        }
        // the submitter relaunches on Lost, so the mark is consumed here
        let lost = !self.connected(&job.lang_name) && self.lost.remove(&job.lang_name);
        self.job = Some(Pending {
            job,
            reply,
            heard: false,
        });
        if lost {
            self.lose();
        }
    }

    fn connected(&self, lang: &str) -> bool {
        self.connections.values().any(|conn| conn.lang == lang)
    }

    /// A worker that never connected cannot report its own death.
    fn worker_exited(&mut self, lang: &str) {
        let waiting = self
            .job
            .as_ref()
            .is_some_and(|pending| pending.job.lang_name == lang && !pending.job.active);
        if waiting && !self.connected(lang) {
            self.crash(format!("{lang} worker exited before it connected"));
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Connected {
                key,
                lang,
                addr,
                writer,
            } => {
                if self.connected(&lang) {
                    warn!(%lang, %addr, "second worker for the same Lang, dropping it");
                    if let Some(reader) = self.readers.shift_remove(&key) {
                        reader.abort();
                    }
                    return;
                }
                debug!(%lang, %addr, "guest worker connected");
                self.lost.remove(&lang);
                self.connections.insert(key, Connection { lang, addr, writer });
            }
            Event::Message { key, message } => self.on_message(key, message),
            Event::Malformed { key, line } => {
                warn!(key, %line, "malformed guest message");
                if self.active_for(key) {
                    self.crash(format!("Guest worker sent a malformed message: {line}"));
                }
            }
            Event::Closed { key } => {
                self.readers.shift_remove(&key);
                let active = self.active_for(key);
                if let Some(conn) = self.connections.shift_remove(&key) {
                    debug!(lang = %conn.lang, addr = %conn.addr, "guest worker disconnected");
                    if active && self.unanswered_call() {
                        self.lose();
                        return;
                    }
                    if active {
                        self.crash(format!(
                            "{} worker disconnected during the call",
                            conn.lang
                        ));
                    }
                    self.lost.insert(conn.lang);
                }
            }
        }
    }

    fn on_message(&mut self, key: usize, message: WorkerMessage) {
        if let WorkerMessage::Heart { .. } = message {
            trace!(key, "guest heartbeat");
            if self.active_for(key) {
                if let Some(pending) = self.job.as_mut() {
                    pending.heard = true;
                }
            }
            return;
        }
        if !self.active_for(key) {
            warn!(key, ?message, "guest message with no job in flight");
            return;
        }
        let (kind, result) = match message {
            WorkerMessage::Crash { result } => (JobKind::Crash, result),
            WorkerMessage::ExeDitlang { result } => (JobKind::ExeDitlang, result),
            WorkerMessage::FinishFunc { result } => (JobKind::FinishFunc, result),
            WorkerMessage::Connect { lang } => {
                warn!(%lang, "worker announced itself twice");
                return;
            }
            WorkerMessage::Heart { .. } => return,
        };
        if let Some(pending) = self.job.as_mut() {
            pending.job.settle(kind, result);
        }
        self.complete();
    }

    /// Whether the in-flight job was handed to the worker on connection `key`.
    fn active_for(&self, key: usize) -> bool {
        match (&self.job, self.connections.get(&key)) {
            (Some(pending), Some(conn)) => pending.job.active && pending.job.lang_name == conn.lang,
            _ => false,
        }
    }

    /// A dispatched `call_func` the worker never acknowledged.
    fn unanswered_call(&self) -> bool {
        self.job
            .as_ref()
            .is_some_and(|pending| pending.job.kind == JobKind::CallFunc && !pending.heard)
    }

    fn lose(&mut self) {
        if let Some(mut pending) = self.job.take() {
            pending.job.active = false;
            trace!(lang = %pending.job.lang_name, func = %pending.job.func_name, "guest job lost its worker");
            let _ = pending.reply.send(Ok(Settled::Lost(pending.job)));
        }
    }

    fn crash(&mut self, text: String) {
        if let Some(pending) = self.job.as_mut() {
            pending.job.settle(JobKind::Crash, serde_json::Value::String(text));
        }
        self.complete();
    }

    fn complete(&mut self) {
        if let Some(pending) = self.job.take() {
            trace!(kind = ?pending.job.kind, func = %pending.job.func_name, "guest job settled");
            let _ = pending.reply.send(Ok(Settled::Done(pending.job)));
        }
    }

    /// Writes a waiting job to its worker once that worker has connected.
    async fn dispatch(&mut self) {
        let Some(pending) = self.job.as_mut() else {
            return;
        };
        if pending.job.active
            || !matches!(pending.job.kind, JobKind::CallFunc | JobKind::DitlangCallback)
        {
            return;
        }
        let Some((&key, conn)) = self
            .connections
            .iter_mut()
            .find(|(_, conn)| conn.lang == pending.job.lang_name)
        else {
            return;
        };
        let mut line = match serde_json::to_string(&pending.job) {
            Ok(line) => line,
            Err(err) => {
                let text = format!("Could not encode guest job: {err}");
                self.crash(text);
                return;
            }
        };
        line.push('\n');
        match conn.writer.write_all(line.as_bytes()).await {
            Ok(()) => {
                pending.job.active = true;
                pending.heard = false;
                trace!(lang = %conn.lang, func = %pending.job.func_name, "guest job dispatched");
            }
            Err(err) => {
                warn!(lang = %conn.lang, %err, "could not reach guest worker");
                let text = format!("Could not reach the {} worker: {err}", conn.lang);
                let call = pending.job.kind == JobKind::CallFunc;
                self.connections.shift_remove(&key);
                if let Some(reader) = self.readers.shift_remove(&key) {
                    reader.abort();
                }
                if call {
                    self.lose();
                } else {
                    self.crash(text);
                }
            }
        }
    }

    fn teardown(mut self) -> std::result::Result<(), Diagnostic> {
        for (_, reader) in self.readers.drain(..) {
            reader.abort();
        }
        let closed = self.connections.len();
        self.connections.clear();
        debug!(closed, "guest daemon stopped");
        if let Some(pending) = self.job.take() {
            let message = format!(
                "Guest daemon shut down while '{}' was in flight",
                pending.job.func_name
            );
            let _ = pending.reply.send(Err(Diagnostic::critical(message.clone())));
            return Err(Diagnostic::critical(message));
        }
        Ok(())
    }
}

/// Reads one worker connection: a `connect` handshake, then one JSON message per line.
async fn read_worker(
    key: usize,
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
) {
    let (read, writer) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let lang = match lines.next_line().await {
        Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Connect { lang }) => lang,
            Ok(other) => {
                warn!(%addr, ?other, "guest worker must send connect first");
                let _ = events.send(Event::Closed { key });
                return;
            }
            Err(err) => {
                warn!(%addr, %err, "unreadable guest handshake");
                let _ = events.send(Event::Closed { key });
                return;
            }
        },
        _ => {
            let _ = events.send(Event::Closed { key });
            return;
        }
    };
    if events
        .send(Event::Connected {
            key,
            lang,
            addr,
            writer,
        })
        .is_err()
    {
        return;
    }
    loop {
        let event = match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str(&line) {
                Ok(message) => Event::Message { key, message },
                Err(_) => Event::Malformed { key, line },
            },
            Ok(None) | Err(_) => {
                let _ = events.send(Event::Closed { key });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}
