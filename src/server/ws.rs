use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::gatekeeper::ConnectRequest;
use crate::multiplexer::Outbound;
use crate::orchestrator::Orchestrator;
use crate::protocol::ClientEvent;

#[derive(Debug, Default, Deserialize)]
pub(super) struct TerminalQuery {
    token: Option<String>,
    session_id: Option<String>,
}

pub(super) async fn terminal_handler(
    ws: WebSocketUpgrade,
    State(orch): State<Orchestrator>,
    Query(q): Query<TerminalQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| terminal_socket(socket, orch, q))
}

async fn terminal_socket(socket: WebSocket, orch: Orchestrator, q: TerminalQuery) {
    let (mut sink, mut stream) = socket.split();
    let (client, mut rx) = orch.client_channel();
    let conn = client.id().to_string();
    tracing::debug!(conn = %conn, "terminal socket opened");

    let mut writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let ev = match out {
                Outbound::Event(ev) => ev,
                Outbound::Close => break,
            };
            let last = ev.is_final();
            if sink.send(Message::Text(ev.to_json().into())).await.is_err() || last {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    });

    let req = ConnectRequest {
        credential: q.token.as_deref(),
        session_id: q.session_id.as_deref(),
    };
    let mut attachment = match orch.connect(req, client).await {
        Ok(a) => a,
        Err(_) => {
            // the client was told why; the writer exits after the close
            let _ = writer.await;
            return;
        }
    };

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match ClientEvent::parse(text.as_str()) {
                    Ok(ev) => attachment.handle(ev).await,
                    Err(e) => tracing::debug!(conn = %conn, error = %e, "ignored client frame"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut writer => break,
        }
    }

    attachment.disconnect().await;
    writer.abort();
    tracing::debug!(conn = %conn, "terminal socket closed");
}
