//! Per-connection runtime.
//!
//! Each socket runs the client lifecycle state machine:
//!
//! ```text
//! None → Initialize → WaitForCommand ⇄ DispatchCommand
//!                                    ↘ Terminate (from any state)
//! ```
//!
//! The run loop owns the read half and drives events from a small
//! queue. Dispatch spawns a short-lived worker that computes the
//! response, writes the framed reply, and only then requeues
//! WaitForCommand — so commands from one connection are strictly
//! serialised: reply N is fully written before command N+1 begins.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, trace};

use crate::client::{ClientLink, ClientRegistry, ClientState};
use crate::dispatch::CmdDispatcher;
use crate::frame::{encode_frame, parse_frame, FrameScan, RawRequest};

const READ_BUFFER_BYTES: usize = 8 * 1024;
const EVENT_QUEUE_DEPTH: usize = 3;

enum CxnEvent {
    Initialize,
    WaitForCommand,
    Dispatch(RawRequest),
    Terminate,
}

/// Connection-side state shared with the client registry.
pub struct ClientCxn {
    started: Instant,
    peer: SocketAddr,
    local: SocketAddr,
    closing: AtomicBool,
    close_notify: Notify,
    event_tx: mpsc::Sender<CxnEvent>,
}

impl ClientLink for ClientCxn {
    fn client_info(&self) -> Vec<String> {
        vec![
            format!("addr={}", self.peer),
            format!("laddr={}", self.local),
            format!("age={}", self.started.elapsed().as_secs()),
        ]
    }

    fn matches_filter(&self, filter: &HashMap<String, String>) -> bool {
        filter.iter().all(|(k, v)| match k.as_str() {
            "addr" => *v == self.peer.to_string(),
            "laddr" => *v == self.local.to_string(),
            _ => true,
        })
    }

    fn request_close(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            // notify_one stores a permit, waking the reader whether or
            // not it is parked in the select yet
            self.close_notify.notify_one();
            let _ = self.event_tx.try_send(CxnEvent::Terminate);
        }
    }

    fn is_close_requested(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Accept a socket: build its link and client state, then run the
/// state machine until Terminate.
pub fn spawn_client_cxn(
    stream: TcpStream,
    dispatcher: Arc<CmdDispatcher>,
    registry: Arc<ClientRegistry>,
    max_frame_bytes: usize,
) {
    let peer = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let local = stream
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let cxn = Arc::new(ClientCxn {
        started: Instant::now(),
        peer,
        local,
        closing: AtomicBool::new(false),
        close_notify: Notify::new(),
        event_tx: event_tx.clone(),
    });
    let cs = registry.register(
        Arc::clone(&dispatcher.store_set),
        Some(Arc::clone(&cxn) as Arc<dyn ClientLink>),
    );

    let _ = event_tx.try_send(CxnEvent::Initialize);
    tokio::spawn(run(
        cxn,
        cs,
        registry,
        dispatcher,
        read_half,
        Arc::new(Mutex::new(write_half)),
        event_rx,
        max_frame_bytes,
    ));
}

#[allow(clippy::too_many_arguments)]
async fn run(
    cxn: Arc<ClientCxn>,
    cs: Arc<ClientState>,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<CmdDispatcher>,
    mut read_half: OwnedReadHalf,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    mut event_rx: mpsc::Receiver<CxnEvent>,
    max_frame_bytes: usize,
) {
    let mut inbound: Vec<u8> = Vec::new();

    loop {
        let Some(event) = event_rx.recv().await else {
            break;
        };
        match event {
            CxnEvent::Initialize => {
                queue(&cxn, CxnEvent::WaitForCommand).await;
            }
            CxnEvent::Terminate => {
                // a command blocked on this client must not outlive it
                cs.unblock("connection closed", true).await;
                let mut writer = write_half.lock().await;
                let _ = writer.shutdown().await;
                drop(writer);
                registry.unregister(cs.id);
                trace!(client = cs.id, peer = %cxn.peer, "client terminated");
                return;
            }
            CxnEvent::WaitForCommand => {
                if cxn.is_close_requested() {
                    queue(&cxn, CxnEvent::Terminate).await;
                    continue;
                }
                // a pipelined frame may already be buffered; serve it
                // before touching the socket again
                if !consume_frame(&cxn, &mut inbound, max_frame_bytes).await {
                    wait_for_data(&cxn, &mut read_half, &mut inbound, max_frame_bytes).await;
                }
            }
            CxnEvent::Dispatch(req) => {
                let cxn = Arc::clone(&cxn);
                let cs = Arc::clone(&cs);
                let dispatcher = Arc::clone(&dispatcher);
                let write_half = Arc::clone(&write_half);
                tokio::spawn(async move {
                    dispatch_one(cxn, cs, dispatcher, write_half, req).await;
                });
            }
        }
    }
}

async fn queue(cxn: &Arc<ClientCxn>, event: CxnEvent) {
    let _ = cxn.event_tx.send(event).await;
}

/// Try to parse one buffered frame; queues Dispatch or Terminate as
/// needed. Returns false when more bytes are required.
async fn consume_frame(cxn: &Arc<ClientCxn>, inbound: &mut Vec<u8>, max_frame_bytes: usize) -> bool {
    match parse_frame(inbound, max_frame_bytes) {
        FrameScan::Incomplete => false,
        FrameScan::Complete { request, consumed } => {
            inbound.drain(..consumed);
            metrics::counter!("treekv_frames_total").increment(1);
            queue(cxn, CxnEvent::Dispatch(request)).await;
            true
        }
        FrameScan::Malformed(e) => {
            info!(peer = %cxn.peer, error = %e, "malformed command sent from client - terminating");
            queue(cxn, CxnEvent::Terminate).await;
            true
        }
    }
}

async fn wait_for_data(
    cxn: &Arc<ClientCxn>,
    read_half: &mut OwnedReadHalf,
    inbound: &mut Vec<u8>,
    max_frame_bytes: usize,
) {
    let mut buffer = [0u8; READ_BUFFER_BYTES];
    tokio::select! {
        result = read_half.read(&mut buffer) => match result {
            Ok(0) => {
                info!(peer = %cxn.peer, "client disconnected");
                queue(cxn, CxnEvent::Terminate).await;
            }
            Ok(n) => {
                inbound.extend_from_slice(&buffer[..n]);
                trace!(peer = %cxn.peer, buffered = inbound.len(), "received command data");
                if !consume_frame(cxn, inbound, max_frame_bytes).await {
                    queue(cxn, CxnEvent::WaitForCommand).await;
                }
            }
            Err(e) => {
                debug!(peer = %cxn.peer, error = %e, "read error");
                queue(cxn, CxnEvent::Terminate).await;
            }
        },
        _ = cxn.close_notify.notified() => {
            queue(cxn, CxnEvent::Terminate).await;
        }
    }
}

/// Worker for one dispatched command: compute, write the framed
/// reply, then hand the connection back to WaitForCommand.
async fn dispatch_one(
    cxn: Arc<ClientCxn>,
    cs: Arc<ClientState>,
    dispatcher: Arc<CmdDispatcher>,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    req: RawRequest,
) {
    let response = match dispatcher.dispatch(&cs, req).await {
        Ok(response) => response,
        Err(e) => {
            debug!(client = cs.id, error = %e, "dispatch error");
            queue(&cxn, CxnEvent::Terminate).await;
            return;
        }
    };

    let framed = encode_frame(&response);
    let mut writer = write_half.lock().await;
    match writer.write_all(&framed).await {
        Ok(()) => {
            trace!(client = cs.id, bytes = framed.len(), "wrote response");
            drop(writer);
            queue(&cxn, CxnEvent::WaitForCommand).await;
        }
        Err(e) => {
            debug!(client = cs.id, error = %e, "write error");
            drop(writer);
            queue(&cxn, CxnEvent::Terminate).await;
        }
    }
}
