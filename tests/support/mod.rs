/*!
Test support helpers shared across integration tests.

- FakeRuntime: scripted in-memory `ContainerRuntime` with call counters; tests push container
  output, end or fail the stream, stop or delete containers behind the orchestrator's back
- StaticProjectStore: project store that hands out a temp directory without extraction
- harness(..) / start(..) / admin_token(..): wiring with a memory store and a fixed JWT secret
- wait_until / next_event: bounded polling helpers
*/

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use sandterm::*;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

pub const SECRET: &str = "test-secret";

/// Collects everything written to a fake container's stdin; fails once `broken` is set.
struct RecordingWriter {
    buf: Arc<Mutex<Vec<u8>>>,
    broken: Arc<AtomicBool>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke")));
        }
        self.buf.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct FakeContainer {
    running: bool,
    spec: ContainerSpec,
    /// One sender per live attach; output is broadcast to all of them.
    outputs: Vec<mpsc::UnboundedSender<io::Result<Vec<u8>>>>,
    input: Arc<Mutex<Vec<u8>>>,
    input_broken: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    ping_down: bool,
    attach_delay: Duration,
    fail_attach: bool,
    resizes: Vec<(String, u16, u16)>,
}

#[derive(Default)]
#[allow(dead_code)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    seq: AtomicUsize,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub attaches: AtomicUsize,
    pub stops: AtomicUsize,
    pub removes: AtomicUsize,
    pub pulls: AtomicUsize,
}

#[allow(dead_code)]
impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }

    /// Create a running container directly, as if started earlier.
    pub fn seed_running(&self) -> String {
        let id = format!("fake-{}", self.seq.fetch_add(1, Ordering::SeqCst));
        self.state.lock().unwrap().containers.insert(
            id.clone(),
            FakeContainer {
                running: true,
                spec: test_spec(),
                outputs: Vec::new(),
                input: Arc::default(),
                input_broken: Arc::default(),
            },
        );
        id
    }

    pub fn exists(&self, id: &str) -> bool {
        self.state.lock().unwrap().containers.contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn spec_of(&self, id: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.spec.clone())
    }

    pub fn input_of(&self, id: &str) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.input.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn push_output(&self, id: &str, bytes: &[u8]) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.containers.get_mut(id) {
            c.outputs.retain(|tx| tx.send(Ok(bytes.to_vec())).is_ok());
        }
    }

    /// The shell exits: the attached stream ends.
    pub fn end_output(&self, id: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.containers.get_mut(id) {
            c.outputs.clear();
            c.running = false;
        }
    }

    pub fn fail_output(&self, id: &str, msg: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(c) = st.containers.get_mut(id) {
            c.outputs
                .retain(|tx| tx.send(Err(io::Error::other(msg.to_string()))).is_ok());
        }
    }

    /// Stop the container without telling anyone.
    pub fn kill(&self, id: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(id) {
            c.running = false;
        }
    }

    /// Delete the container without telling anyone.
    pub fn vanish(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    /// Every later write to the container's stdin fails with a broken pipe.
    pub fn break_input(&self, id: &str) {
        if let Some(c) = self.state.lock().unwrap().containers.get(id) {
            c.input_broken.store(true, Ordering::SeqCst);
        }
    }

    pub fn set_ping_down(&self, down: bool) {
        self.state.lock().unwrap().ping_down = down;
    }

    pub fn set_attach_delay(&self, d: Duration) {
        self.state.lock().unwrap().attach_delay = d;
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.state.lock().unwrap().fail_attach = fail;
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.state.lock().unwrap().resizes.clone()
    }
}

fn test_spec() -> ContainerSpec {
    ContainerSpec {
        image: "alpine:3.20".into(),
        bind_source: "/tmp".into(),
        mount_point: "/app".into(),
        memory_bytes: 0,
        memory_swap_bytes: 0,
        cpuset_cpus: "0".into(),
        network_mode: "bridge".into(),
        security_opt: vec![],
        env: vec![],
        cmd: vec![],
        working_dir: "/app".into(),
        labels: HashMap::new(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        if self.state.lock().unwrap().ping_down {
            return Err(RuntimeError::Unavailable("fake runtime is down".into()));
        }
        Ok(())
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{}", self.seq.fetch_add(1, Ordering::SeqCst));
        self.state.lock().unwrap().containers.insert(
            id.clone(),
            FakeContainer {
                running: false,
                spec: spec.clone(),
                outputs: Vec::new(),
                input: Arc::default(),
                input_broken: Arc::default(),
            },
        );
        Ok(ContainerHandle { id })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().unwrap();
        let c = st
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.into()))?;
        c.running = true;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
        let st = self.state.lock().unwrap();
        let c = st
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.into()))?;
        Ok(ContainerStatus {
            id: id.to_string(),
            running: c.running,
        })
    }

    async fn attach(&self, id: &str) -> Result<Attached, RuntimeError> {
        self.attaches.fetch_add(1, Ordering::SeqCst);
        let (delay, fail) = {
            let st = self.state.lock().unwrap();
            (st.attach_delay, st.fail_attach)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(RuntimeError::Api {
                status: 500,
                message: "attach refused".into(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let (input, broken) = {
            let mut st = self.state.lock().unwrap();
            let c = st
                .containers
                .get_mut(id)
                .ok_or_else(|| RuntimeError::NotFound(id.into()))?;
            c.outputs.push(tx);
            (c.input.clone(), c.input_broken.clone())
        };
        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(Attached {
            output,
            input: Box::pin(RecordingWriter {
                buf: input,
                broken,
            }),
        })
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError> {
        let mut st = self.state.lock().unwrap();
        if !st.containers.contains_key(id) {
            return Err(RuntimeError::NotFound(id.into()));
        }
        st.resizes.push((id.to_string(), cols, rows));
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().unwrap();
        let c = st
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.into()))?;
        c.running = false;
        c.outputs.clear();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.into()))
    }
}

/// Hands out `<root>/<project_id>` without any archive handling.
pub struct StaticProjectStore {
    root: tempfile::TempDir,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl StaticProjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(StaticProjectStore {
            root: tempfile::tempdir().expect("tempdir"),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ProjectStore for StaticProjectStore {
    fn source_path(&self, project_id: &str) -> Result<PathBuf, ProjectError> {
        Ok(self.root.path().join(project_id))
    }

    async fn ensure_extracted(&self, project_id: &str) -> Result<PathBuf, ProjectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let p = self.source_path(project_id)?;
        std::fs::create_dir_all(&p)?;
        Ok(p)
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub orch: Orchestrator,
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<MemorySessionStore>,
    pub projects: Arc<StaticProjectStore>,
}

#[allow(dead_code)]
pub fn harness(settings: SessionSettings) -> Harness {
    let runtime = FakeRuntime::new();
    let store = Arc::new(MemorySessionStore::new());
    let projects = StaticProjectStore::new();
    let orch = Orchestrator::new(
        Collaborators {
            verifier: Arc::new(JwtVerifier::new(SECRET)),
            sessions: store.clone(),
            projects: projects.clone(),
            runtime: runtime.clone(),
        },
        SandboxConfig::default(),
        settings,
    );
    Harness {
        orch,
        runtime,
        store,
        projects,
    }
}

/// Start a session for (project, operator); returns (session id, container id).
#[allow(dead_code)]
pub async fn start(h: &Harness, project: &str, operator: &str) -> (String, String) {
    let started = h
        .orch
        .start_session(&admin(operator), project)
        .await
        .expect("start session");
    let rec = h
        .store
        .find(&started.session_id)
        .await
        .expect("store")
        .expect("record");
    (started.session_id, rec.container_id)
}

/// Open a terminal connection like a transport would.
#[allow(dead_code)]
pub async fn connect(
    h: &Harness,
    operator: &str,
    session_id: &str,
) -> (Result<Attachment, SessionError>, ClientRx) {
    let (client, rx) = h.orch.client_channel();
    let token = admin_token(operator);
    let res = h
        .orch
        .connect(
            ConnectRequest {
                credential: Some(&token),
                session_id: Some(session_id),
            },
            client,
        )
        .await;
    (res, rx)
}

#[allow(dead_code)]
pub fn admin(operator: &str) -> Principal {
    Principal {
        operator_id: operator.to_string(),
        role: Role::Admin,
    }
}

#[allow(dead_code)]
pub fn token_for(operator: &str, role: Role) -> String {
    JwtVerifier::new(SECRET)
        .issue(operator, role, Duration::from_secs(3600))
        .expect("issue token")
}

#[allow(dead_code)]
pub fn admin_token(operator: &str) -> String {
    token_for(operator, Role::Admin)
}

/// Poll `f` every 10ms until it holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next outbound item within 2s; `None` when the connection ended or nothing arrived.
#[allow(dead_code)]
pub async fn next_event(rx: &mut ClientRx) -> Option<Outbound> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

/// Concatenate `output` events until `needle` shows up (or 2s pass).
#[allow(dead_code)]
pub async fn read_output_until(rx: &mut ClientRx, needle: &str) -> String {
    let mut acc = String::new();
    while !acc.contains(needle) {
        match next_event(rx).await {
            Some(Outbound::Event(ServerEvent::Output { data })) => acc.push_str(&data),
            Some(_) => {}
            None => break,
        }
    }
    acc
}
