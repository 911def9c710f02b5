//! WebSocket connection loop.
//!
//! One reader loop and one writer task per socket. The writer merges the
//! socket's [`ClientEvent`] queue with call responses; once the socket is
//! closed it flushes what is queued, sends a close frame and exits.

use crate::auth::AuthEngine;
use crate::controller::Response;
use crate::errors::WorkerError;
use crate::socket::ClientEvent;
use crate::transport::frames::{salvage_call_id, ClientFrame, ServerFrame};
use crate::worker::{Connection, Worker};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Responses waiting for the writer.
const OUTBOUND_BUFFER: usize = 256;

/// How long the writer may take to flush after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type WsSender = SplitSink<WebSocket, Message>;

#[instrument(skip_all, fields(sid = %connection.engine.socket().sid()))]
pub async fn serve_socket(socket: WebSocket, worker: Arc<Worker>, connection: Connection) {
    let Connection { engine, events } = connection;
    let sid = engine.socket().sid().clone();
    let closed = engine.socket().closed_token();
    let (sender, mut receiver) = socket.split();
    let (responses, outbound) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(run_writer(sender, events, outbound, closed.clone()));

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&worker, &engine, &responses, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(target: "worker.transport", error = %e, "WebSocket error");
                    break;
                }
            }
        }
    }

    worker.disconnect(&sid);
    drop(responses);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(target: "worker.transport", "Writer did not drain in time");
    }
}

fn dispatch(
    worker: &Arc<Worker>,
    engine: &AuthEngine,
    responses: &mpsc::Sender<ServerFrame>,
    text: &str,
) {
    let frame = match ClientFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(target: "worker.transport", error = %e, "Malformed client frame");
            if let Some(cid) = salvage_call_id(text) {
                let res = Response {
                    errors: worker.dehydrate(WorkerError::InvalidRequest(e.to_string())),
                    result: None,
                };
                let _ = responses.try_send(ServerFrame::Response { rid: cid, res });
            }
            return;
        }
    };

    let (worker, engine, responses) = (Arc::clone(worker), engine.clone(), responses.clone());
    match frame {
        ClientFrame::Request { cid, req } => {
            tokio::spawn(async move {
                let res = worker.handle_request(&engine, req).await;
                let _ = responses.send(ServerFrame::Response { rid: cid, res }).await;
            });
        }
        ClientFrame::Fetch { fid, fetch } => {
            tokio::spawn(async move {
                let res = worker.fetch(&engine, fetch).await;
                let _ = responses.send(ServerFrame::FetchResponse { fid, res }).await;
            });
        }
        ClientFrame::Receiver { rec } => worker.handle_receiver(&engine, rec),
    }
}

async fn run_writer(
    mut sender: WsSender,
    mut events: mpsc::Receiver<ClientEvent>,
    mut outbound: mpsc::Receiver<ServerFrame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            Some(event) = events.recv() => ServerFrame::from(event),
            Some(frame) = outbound.recv() => frame,
            () = closed.cancelled() => break,
            else => break,
        };
        if send_frame(&mut sender, &frame).await.is_err() {
            return;
        }
    }

    while let Ok(event) = events.try_recv() {
        if send_frame(&mut sender, &ServerFrame::from(event)).await.is_err() {
            return;
        }
    }
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_frame(sender: &mut WsSender, frame: &ServerFrame) -> Result<(), axum::Error> {
    match frame.encode() {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(e) => {
            warn!(target: "worker.transport", error = %e, "Dropping unencodable frame");
            Ok(())
        }
    }
}
