#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use termify_channel::{
    Backing, Channel, ChannelError, ChannelExit, ChannelKind, ChannelOpener, ChannelOutput,
    Geometry, LocalSpawn, OpenedChannel, OutputStream,
};
use termify_session::{CreateSession, Engine, EngineConfig, SessionEvent, Subscription};

pub const PROMPT: &str = "$ ";

type FailureFactory = Box<dyn Fn() -> ChannelError + Send + Sync>;

/// Opens scripted in-memory shells instead of real ones.
#[derive(Default)]
pub struct FakeOpener {
    opened: AtomicUsize,
    failures: Mutex<VecDeque<FailureFactory>>,
    shells: Mutex<Vec<Arc<FakeShell>>>,
}

impl FakeOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next open fail with the error built by `make`.
    pub fn fail_next(&self, make: impl Fn() -> ChannelError + Send + Sync + 'static) {
        self.failures.lock().unwrap().push_back(Box::new(make));
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// The most recently opened shell.
    pub fn last_shell(&self) -> Arc<FakeShell> {
        Arc::clone(self.shells.lock().unwrap().last().expect("no shell opened"))
    }

    pub fn shells(&self) -> Vec<Arc<FakeShell>> {
        self.shells.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelOpener for FakeOpener {
    async fn open(
        &self,
        _backing: &Backing,
        geometry: Geometry,
    ) -> Result<OpenedChannel, ChannelError> {
        if let Some(make) = self.failures.lock().unwrap().pop_front() {
            return Err(make());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let (tx, output) = OutputStream::channel(256);
        tx.try_send(ChannelOutput::Data(PROMPT.as_bytes().to_vec()))
            .unwrap();
        let shell = Arc::new(FakeShell {
            tx: Mutex::new(Some(tx)),
            written: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            geometry: Mutex::new(geometry),
            closed: AtomicBool::new(false),
            close_delay: Mutex::new(Duration::ZERO),
        });
        self.shells.lock().unwrap().push(Arc::clone(&shell));
        Ok(OpenedChannel {
            channel: Arc::new(FakeChannel(shell)),
            output,
        })
    }
}

/// A tiny line-oriented shell.
///
/// Echoes every line, then:
/// - `echo ARGS` prints `ARGS`
/// - `sleep ...` prints nothing and never shows the prompt again
/// - `exit N` ends the channel with exit code `N`
/// - `flood N` prints `N` numbered lines
/// - `color` prints a colored line and a colored prompt
/// - anything else prints nothing
///
/// and shows `$ ` unless the command hung or exited.
pub struct FakeShell {
    tx: Mutex<Option<tokio::sync::mpsc::Sender<ChannelOutput>>>,
    written: Mutex<Vec<u8>>,
    pending: Mutex<Vec<u8>>,
    geometry: Mutex<Geometry>,
    closed: AtomicBool,
    close_delay: Mutex<Duration>,
}

impl FakeShell {
    /// Make `close` take this long, as a shell slow to exit would.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }

    pub fn geometry(&self) -> Geometry {
        *self.geometry.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push output as if the shell printed it unprompted.
    pub async fn emit(&self, data: &[u8]) {
        self.send(ChannelOutput::Data(data.to_vec())).await;
    }

    /// End the channel as if the process died.
    pub async fn die(&self, exit_code: Option<u32>) {
        self.send(ChannelOutput::Closed(ChannelExit { exit_code }))
            .await;
        self.tx.lock().unwrap().take();
    }

    async fn send(&self, item: ChannelOutput) {
        let tx = self.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(item).await;
        }
    }

    async fn run_line(&self, line: &str) {
        self.emit(format!("{line}\r\n").as_bytes()).await;
        let mut words = line.split_whitespace();
        match words.next() {
            Some("echo") => {
                let rest: Vec<_> = words.collect();
                self.emit(format!("{}\r\n", rest.join(" ")).as_bytes()).await;
            }
            Some("sleep") => return,
            Some("exit") => {
                let code = words.next().and_then(|c| c.parse().ok()).unwrap_or(0);
                self.die(Some(code)).await;
                return;
            }
            Some("flood") => {
                let count: usize = words.next().and_then(|c| c.parse().ok()).unwrap_or(0);
                for i in 0..count {
                    self.emit(format!("line {i}\r\n").as_bytes()).await;
                }
            }
            Some("color") => {
                self.emit(b"\x1b[32mgreen\x1b[0m\r\n").await;
                self.emit(b"\x1b[1;34muser@host\x1b[0m:~$ ").await;
                return;
            }
            _ => {}
        }
        self.emit(PROMPT.as_bytes()).await;
    }
}

struct FakeChannel(Arc<FakeShell>);

#[async_trait]
impl Channel for FakeChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Local
    }

    async fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.0.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.0.written.lock().unwrap().extend_from_slice(data);

        let lines: Vec<String> = {
            let mut pending = self.0.pending.lock().unwrap();
            pending.extend_from_slice(data);
            let mut lines = Vec::new();
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
            }
            lines
        };
        for line in lines {
            self.0.run_line(&line).await;
        }
        Ok(())
    }

    async fn resize(&self, geometry: Geometry) -> Result<(), ChannelError> {
        if self.0.is_closed() {
            return Err(ChannelError::Closed);
        }
        *self.0.geometry.lock().unwrap() = geometry;
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        let delay = *self.0.close_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if !self.0.closed.swap(true, Ordering::SeqCst) {
            self.0.die(None).await;
        }
        Ok(())
    }
}

pub fn fake_engine() -> (Engine, Arc<FakeOpener>) {
    fake_engine_with(EngineConfig::default())
}

pub fn fake_engine_with(config: EngineConfig) -> (Engine, Arc<FakeOpener>) {
    let opener = FakeOpener::new();
    let engine = Engine::with_opener(config, opener.clone()).expect("valid config");
    (engine, opener)
}

pub fn local(id: &str) -> CreateSession {
    CreateSession {
        id: id.to_string(),
        owner_id: "owner-1".to_string(),
        backing: Backing::Local(LocalSpawn::default()),
        geometry: Geometry::default(),
    }
}

/// Create a session and wait until its first prompt is buffered.
pub async fn create_ready(engine: &Engine, id: &str) {
    engine.create(local(id)).await.expect("create");
    wait_for_buffer(engine, id, PROMPT).await;
}

/// Poll the buffer until it ends with `suffix`.
pub async fn wait_for_buffer(engine: &Engine, id: &str, suffix: &str) {
    for _ in 0..500 {
        let buffer = engine.get_buffer(id).await.expect("buffer");
        if buffer.ends_with(suffix.as_bytes()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("buffer of {id} never ended with {suffix:?}");
}

/// Next event, failing the test if none arrives in time.
pub async fn next_event(sub: &mut Subscription) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed")
}

/// Read events until `Closed`, returning the output seen on the way.
pub async fn output_until_closed(sub: &mut Subscription) -> (Vec<u8>, SessionEvent) {
    let mut output = Vec::new();
    loop {
        match next_event(sub).await {
            SessionEvent::Output(data) => output.extend(data),
            closed @ SessionEvent::Closed { .. } => return (output, closed),
            SessionEvent::Status(_) => {}
        }
    }
}
