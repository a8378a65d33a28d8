//! Engine lifecycle: listener, accept loop, periodic saver, graceful
//! shutdown, and the embedded dispatch path.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{error, info, trace};

use crate::client::{ClientRegistry, ClientState};
use crate::config::Config;
use crate::conn::spawn_client_cxn;
use crate::dispatch::{CmdDispatcher, OpLog};
use crate::frame::RawRequest;
use crate::store_set::StoreSet;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("already started")]
    AlreadyStarted,
    #[error("not started")]
    NotStarted,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Default)]
struct EngineState {
    started: bool,
    terminating: bool,
    local_addr: Option<SocketAddr>,
    shutdown: Option<Arc<Notify>>,
    store_set: Option<Arc<StoreSet>>,
    dispatcher: Option<Arc<CmdDispatcher>>,
    clients: Option<Arc<ClientRegistry>>,
    exit_saver: Option<mpsc::Sender<()>>,
    saver_done: Option<oneshot::Receiver<()>>,
    direct_client: Option<Arc<ClientState>>,
}

/// One command server instance. Start it, stop it, wait for the stop
/// to drain.
pub struct Server {
    state: Mutex<EngineState>,
    terminated: AtomicBool,
    can_exit: Notify,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            terminated: AtomicBool::new(false),
            can_exit: Notify::new(),
        }
    }

    /// Bind the listener, load persisted stores, and start serving.
    pub async fn start_server(
        &self,
        config: &Config,
        op_log: Option<Arc<dyn OpLog>>,
    ) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.started {
                return Err(ServerError::AlreadyStarted);
            }
            state.started = true;
        }
        match self.start_inner(config, op_log).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().unwrap().started = false;
                Err(e)
            }
        }
    }

    async fn start_inner(
        &self,
        config: &Config,
        op_log: Option<Arc<dyn OpLog>>,
    ) -> Result<(), ServerError> {
        let store_set = StoreSet::new(config.base_path_buf(), config.app_version).await?;
        let clients = Arc::new(ClientRegistry::new());
        let dispatcher = Arc::new(CmdDispatcher::new(
            Arc::clone(&store_set),
            Arc::clone(&clients),
            op_log,
        ));

        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        let shutdown = Arc::new(Notify::new());
        {
            let shutdown = Arc::clone(&shutdown);
            let dispatcher = Arc::clone(&dispatcher);
            let clients = Arc::clone(&clients);
            let max_frame = config.max_frame_bytes;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => match result {
                            Ok((stream, peer)) => {
                                info!(%peer, "client connected");
                                spawn_client_cxn(
                                    stream,
                                    Arc::clone(&dispatcher),
                                    Arc::clone(&clients),
                                    max_frame,
                                );
                            }
                            Err(e) => {
                                error!(error = %e, "accept error");
                                break;
                            }
                        },
                        _ = shutdown.notified() => {
                            trace!("closing server");
                            break;
                        }
                    }
                }
            });
        }

        let (exit_saver, saver_done) = if store_set.base_path().is_some() {
            let (exit_tx, exit_rx) = mpsc::channel(1);
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(periodic_save(
                Arc::clone(&store_set),
                config.save_interval_secs.max(1),
                exit_rx,
                done_tx,
            ));
            (Some(exit_tx), Some(done_rx))
        } else {
            (None, None)
        };

        let mut state = self.state.lock().unwrap();
        state.local_addr = Some(local_addr);
        state.shutdown = Some(shutdown);
        state.store_set = Some(store_set);
        state.dispatcher = Some(dispatcher);
        state.clients = Some(clients);
        state.exit_saver = exit_saver;
        state.saver_done = saver_done;
        Ok(())
    }

    /// Initiate termination. Idempotent after the first call; the
    /// drain runs in the background — use
    /// [`wait_for_termination`](Self::wait_for_termination) to join it.
    pub fn stop_server(self: &Arc<Self>) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return Err(ServerError::NotStarted);
        }
        if state.terminating {
            return Ok(());
        }
        state.terminating = true;

        let shutdown = state.shutdown.take();
        let clients = state.clients.clone();
        let exit_saver = state.exit_saver.take();
        let saver_done = state.saver_done.take();
        drop(state);

        let server = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(shutdown) = shutdown {
                // notify_one stores a permit, so the accept loop sees
                // the signal even if it is mid-accept right now
                shutdown.notify_one();
            }

            if let Some(clients) = clients {
                info!("waiting for any open request connections to complete");
                for cs in clients.snapshot() {
                    // a parked blocking command must end before the
                    // client can unregister
                    cs.unblock("server shutting down", true).await;
                    match cs.link() {
                        Some(link) => link.request_close(),
                        // embedded clients have no connection to drain
                        None => clients.unregister(cs.id),
                    }
                }
                while clients.is_any_active() {
                    tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
                }
            }

            if let Some(exit_saver) = exit_saver {
                trace!("closing database saver");
                let _ = exit_saver.send(()).await;
                if let Some(done) = saver_done {
                    let _ = done.await;
                }
                trace!("database saver closed");
            }

            info!("termination completed");
            server.terminated.store(true, Ordering::SeqCst);
            server.can_exit.notify_waiters();
        });
        Ok(())
    }

    /// Block until a prior [`stop_server`](Self::stop_server) has
    /// fully drained.
    pub async fn wait_for_termination(&self) {
        loop {
            let notified = self.can_exit.notified();
            if self.terminated.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().local_addr
    }

    /// Embedded dispatch, bypassing the socket: the same dispatcher
    /// serves a lazily created direct client.
    pub async fn dispatch(&self, escaped_args: &[Vec<u8>]) -> Result<Vec<u8>, ServerError> {
        let (dispatcher, client) = {
            let mut state = self.state.lock().unwrap();
            let Some(dispatcher) = state.dispatcher.clone() else {
                return Err(ServerError::NotStarted);
            };
            if state.direct_client.is_none() {
                let clients = state.clients.clone().ok_or(ServerError::NotStarted)?;
                state.direct_client =
                    Some(clients.register(Arc::clone(&dispatcher.store_set), None));
            }
            let client = state.direct_client.clone().ok_or(ServerError::NotStarted)?;
            (dispatcher, client)
        };
        let req = RawRequest::from_tokens(escaped_args.iter().map(Vec::as_slice));
        Ok(dispatcher.dispatch(&client, req).await?)
    }

    #[cfg(test)]
    pub(crate) fn clients_active(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .clients
            .as_ref()
            .is_some_and(|c| c.is_any_active())
    }
}

/// One-second ticker (by default) that drains the dirty counter; on
/// exit it performs a final save before acknowledging.
async fn periodic_save(
    store_set: Arc<StoreSet>,
    interval_secs: u64,
    mut exit_rx: mpsc::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) {
    info!(interval_secs, "periodic save task started");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.tick().await; // the first tick is immediate
    loop {
        tokio::select! {
            _ = exit_rx.recv() => {
                trace!("saver loop is exiting");
                if let Err(e) = store_set.save().await {
                    error!(error = %e, "final save failed");
                }
                let _ = done_tx.send(());
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = store_set.save().await {
                    error!(error = %e, "periodic save failed");
                }
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
