/*!
Stream multiplexer: bridges a container's TTY byte stream and a terminal client.

- `ClientHandle` is the sending half of one connection's bounded outbound queue. A send that
  cannot enqueue within `slow_client_timeout` fails with `SendFailure::TooSlow`; the caller
  then disconnects the client and releases the session.
- `pump_output` forwards container output in order, checking before every chunk that its
  stream is still the session's stream of record.
- `Attachment` is what a connection holds once setup completed: it applies the line
  discipline to input and routes resizes, both gated on ownership.
*/

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

use crate::discipline::{Effect, LineDiscipline};
use crate::orchestrator::Orchestrator;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::registry::SessionRegistry;
use crate::runtime::OutputStream;
use crate::util::id::connection_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Close the connection after everything queued before it was sent.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The receiving side is gone.
    Gone,
    /// The queue stayed full for longer than the slow-client timeout.
    TooSlow,
}

#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: String,
    tx: mpsc::Sender<Outbound>,
    abort: std::sync::Arc<watch::Sender<bool>>,
    slow_client_timeout: Duration,
}

/// Receiving half of a connection's outbound queue, owned by the transport.
#[derive(Debug)]
pub struct ClientRx {
    events: mpsc::Receiver<Outbound>,
    abort: watch::Receiver<bool>,
}

impl ClientHandle {
    pub fn channel(capacity: usize, slow_client_timeout: Duration) -> (ClientHandle, ClientRx) {
        let (tx, events) = mpsc::channel(capacity.max(1));
        let (abort_tx, abort) = watch::channel(false);
        (
            ClientHandle {
                id: connection_id(),
                tx,
                abort: std::sync::Arc::new(abort_tx),
                slow_client_timeout,
            },
            ClientRx { events, abort },
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || *self.abort.borrow()
    }

    pub async fn send(&self, event: ServerEvent) -> Result<(), SendFailure> {
        use mpsc::error::SendTimeoutError;
        match self
            .tx
            .send_timeout(Outbound::Event(event), self.slow_client_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(SendFailure::Gone),
            Err(SendTimeoutError::Timeout(_)) => Err(SendFailure::TooSlow),
        }
    }

    /// Send a last event (if any) and ask the transport to close. Best effort.
    pub async fn finish(&self, last: Option<ServerEvent>) {
        if let Some(ev) = last {
            if self.send(ev).await.is_err() {
                self.abort();
                return;
            }
        }
        if self
            .tx
            .send_timeout(Outbound::Close, self.slow_client_timeout)
            .await
            .is_err()
        {
            self.abort();
        }
    }

    /// Drop the connection now, discarding anything still queued.
    pub fn abort(&self) {
        self.abort.send_replace(true);
    }
}

impl ClientRx {
    /// Next outbound item; `None` once the connection was aborted or every handle is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        if *self.abort.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            Ok(_) = self.abort.wait_for(|a| *a) => None,
            ev = self.events.recv() => ev,
        }
    }
}

/// Holds back an incomplete trailing UTF-8 sequence so a multibyte character split across
/// chunks is emitted whole with the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let cut = complete_prefix_len(&self.pending);
        let rest = self.pending.split_off(cut);
        let head = std::mem::replace(&mut self.pending, rest);
        String::from_utf8_lossy(&head).into_owned()
    }

    /// Flush whatever is held back, lossily.
    pub fn finish(&mut self) -> String {
        let head = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&head).into_owned()
    }
}

fn complete_prefix_len(b: &[u8]) -> usize {
    let n = b.len();
    for back in 1..=n.min(4) {
        let i = n - back;
        let byte = b[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { i } else { n };
    }
    n
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The container closed the stream (shell exited).
    Ended,
    Failed(String),
    ClientGone,
    ClientTooSlow,
    /// The registry no longer lists this stream; someone else owns the teardown.
    Superseded,
}

/// Forward container output to `client` until the stream ends or ownership changes.
pub async fn pump_output(
    mut output: OutputStream,
    session_id: &str,
    token: &str,
    client: &ClientHandle,
    registry: &SessionRegistry,
) -> PumpExit {
    let mut carry = Utf8Carry::default();
    loop {
        let (text, exit) = match output.next().await {
            Some(Ok(chunk)) => (carry.push(&chunk), None),
            Some(Err(e)) => (carry.finish(), Some(PumpExit::Failed(e.to_string()))),
            None => (carry.finish(), Some(PumpExit::Ended)),
        };
        if !registry.is_current(session_id, token) {
            return PumpExit::Superseded;
        }
        if !text.is_empty() {
            match client.send(ServerEvent::output(text)).await {
                Ok(()) => {}
                Err(SendFailure::Gone) => return PumpExit::ClientGone,
                Err(SendFailure::TooSlow) => return PumpExit::ClientTooSlow,
            }
        }
        if let Some(exit) = exit {
            return exit;
        }
    }
}

/// A connection's live binding to a session.
pub struct Attachment {
    session_id: String,
    client: ClientHandle,
    discipline: LineDiscipline,
    orchestrator: Orchestrator,
}

impl Attachment {
    pub(crate) fn new(session_id: String, client: ClientHandle, orchestrator: Orchestrator) -> Self {
        Attachment {
            session_id,
            client,
            discipline: LineDiscipline::new(),
            orchestrator,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client(&self) -> &ClientHandle {
        &self.client
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Input { data } => self.input(&data).await,
            ClientEvent::Resize { cols, rows } => self.resize(cols, rows).await,
        }
    }

    async fn input(&mut self, data: &str) {
        let effects = self.discipline.feed(data);
        for effect in effects {
            match effect {
                Effect::Echo(text) => {
                    if let Err(f) = self.client.send(ServerEvent::output(text)).await {
                        self.orchestrator
                            .client_failed(&self.session_id, &self.client, f)
                            .await;
                        return;
                    }
                }
                Effect::Forward(bytes) => {
                    let registry = self.orchestrator.registry();
                    let Some(writer) = registry.writer_for(&self.session_id, self.client.id())
                    else {
                        tracing::debug!(session_id = %self.session_id, conn = %self.client.id(), "input dropped: not the owner");
                        return;
                    };
                    let res = {
                        let mut w = writer.lock().await;
                        match w.write_all(&bytes).await {
                            Ok(()) => w.flush().await,
                            Err(e) => Err(e),
                        }
                    };
                    if let Err(e) = res {
                        self.orchestrator
                            .stream_failed(&self.session_id, &self.client, e.to_string())
                            .await;
                        return;
                    }
                }
            }
        }
    }

    async fn resize(&self, cols: u16, rows: u16) {
        let registry = self.orchestrator.registry();
        let Some(container) = registry.container_for(&self.session_id, self.client.id()) else {
            return;
        };
        if cols == 0 || rows == 0 {
            let _ = self
                .client
                .send(ServerEvent::error(
                    "Failed to resize terminal: cols and rows must be positive",
                ))
                .await;
            return;
        }
        if let Err(e) = self
            .orchestrator
            .lifecycle()
            .resize(&container, cols, rows)
            .await
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "resize failed");
            let _ = self
                .client
                .send(ServerEvent::error(format!("Failed to resize terminal: {e}")))
                .await;
        }
    }

    /// The connection went away. Applies the disconnect policy if this connection still
    /// owns the session.
    pub async fn disconnect(self) {
        self.orchestrator
            .disconnected(&self.session_id, self.client.id())
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carry_holds_split_multibyte() {
        let mut c = Utf8Carry::default();
        let snow = "☃".as_bytes();
        assert_eq!(c.push(&[b'a', snow[0]]), "a");
        assert_eq!(c.push(&snow[1..2]), "");
        assert_eq!(c.push(&[snow[2], b'b']), "☃b");
        assert_eq!(c.finish(), "");
    }

    #[test]
    fn carry_passes_invalid_bytes_lossily() {
        let mut c = Utf8Carry::default();
        assert_eq!(c.push(&[0xff, b'x']), "\u{fffd}x");
        assert_eq!(c.push(&[0xe2]), "");
        assert_eq!(c.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn slow_client_times_out() {
        let (h, _rx) = ClientHandle::channel(1, Duration::from_millis(20));
        h.send(ServerEvent::output("a")).await.unwrap();
        assert_eq!(
            h.send(ServerEvent::output("b")).await,
            Err(SendFailure::TooSlow)
        );
    }

    #[tokio::test]
    async fn gone_client_is_reported() {
        let (h, rx) = ClientHandle::channel(4, Duration::from_millis(20));
        drop(rx);
        assert!(h.is_closed());
        assert_eq!(
            h.send(ServerEvent::output("a")).await,
            Err(SendFailure::Gone)
        );
    }

    #[tokio::test]
    async fn abort_wins_over_queued_events() {
        let (h, mut rx) = ClientHandle::channel(4, Duration::from_millis(20));
        h.send(ServerEvent::output("a")).await.unwrap();
        h.abort();
        assert!(h.is_closed());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn finish_queues_event_then_close() {
        let (h, mut rx) = ClientHandle::channel(4, Duration::from_millis(20));
        h.finish(Some(ServerEvent::terminated("bye"))).await;
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Event(ServerEvent::terminated("bye")))
        );
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }
}
