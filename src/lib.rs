/*!
sandterm: operator-owned terminal sessions, one sandboxed container per submission.

Module overview:
- gatekeeper: credential and ownership checks before any container work
- registry: in-memory single-owner arbitration per session id
- lifecycle: create/recreate/attach/resize/terminate through a `ContainerRuntime`
- discipline, multiplexer: line discipline for input, ordered output pump, backpressure
- orchestrator: ties the above together; `server` exposes it over HTTP/WebSocket
- store: durable session records and project sources
*/

pub mod auth;
pub mod config;
pub mod discipline;
pub mod errors;
pub mod gatekeeper;
pub mod lifecycle;
pub mod lock;
pub mod multiplexer;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod util;

pub use auth::{bearer_token, AuthVerifier, JwtVerifier, Principal, Role};
pub use config::{Config, DisconnectPolicy, DockerEndpoint, SandboxConfig, SessionSettings};
pub use discipline::{Effect, LineDiscipline};
pub use errors::{
    display_for_setup_error, exit_code_for_error, exit_code_for_io_error, AuthFailure,
    SessionError,
};
pub use gatekeeper::{Admission, ConnectRequest, Gatekeeper};
pub use lifecycle::{LifecycleManager, StartedSession, Termination};
pub use lock::{acquire_lock_at, StoreLock};
pub use multiplexer::{Attachment, ClientHandle, ClientRx, Outbound, SendFailure};
pub use orchestrator::{Collaborators, Orchestrator};
pub use protocol::{ClientEvent, ServerEvent};
pub use registry::{ReleaseReason, SessionRegistry};
pub use runtime::{
    Attached, ContainerHandle, ContainerRuntime, ContainerSpec, ContainerStatus, DockerRuntime,
    InputSink, OutputStream, RuntimeError,
};
pub use store::project::{DirProjectStore, ProjectError, ProjectStore};
pub use store::{
    FileSessionStore, MemorySessionStore, RecordUpdate, SessionRecord, SessionStatus,
    SessionStore, StoreError,
};
pub use telemetry::telemetry_init;
