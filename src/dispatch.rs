//! Command dispatch.
//!
//! One dispatcher serves every client: it numbers requests, feeds the
//! op-log, parses argv against the registry, runs the handler, and
//! marshals the response map to JSON. Parse and handler failures
//! become `{"error": ...}` replies; only marshaling and op-log result
//! failures surface to the connection (which then closes).

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, error, trace};

use crate::client::{ClientRegistry, ClientState};
use crate::command::{parse_argv, CmdContext, CommandRegistry};
use crate::frame::RawRequest;
use crate::handlers;
use crate::store_set::StoreSet;
use crate::tree::now_ns;

/// Observer fed one record per request and one per response. Request
/// records are best-effort; result record failures surface to the
/// caller.
pub trait OpLog: Send + Sync {
    fn log_request(&self, req_number: u64, modify: bool, args: &[Vec<u8>]) -> io::Result<()>;
    fn log_result(&self, req_number: u64, modify: bool, response: &[u8]) -> io::Result<()>;
}

pub struct CmdDispatcher {
    registry: CommandRegistry,
    pub store_set: Arc<StoreSet>,
    pub clients: Arc<ClientRegistry>,
    op_log: Option<Arc<dyn OpLog>>,
    req_number: Mutex<u64>,
}

impl CmdDispatcher {
    pub fn new(
        store_set: Arc<StoreSet>,
        clients: Arc<ClientRegistry>,
        op_log: Option<Arc<dyn OpLog>>,
    ) -> Self {
        let mut registry = CommandRegistry::new();
        handlers::register_all(&mut registry);
        Self {
            registry,
            store_set,
            clients,
            op_log,
            req_number: Mutex::new(0),
        }
    }

    /// Strictly monotonic across the process, seeded from the clock so
    /// numbers survive restarts in order.
    fn next_request_number(&self) -> u64 {
        let mut counter = self.req_number.lock().unwrap();
        let candidate = now_ns() as u64;
        *counter = candidate.max(*counter + 1);
        *counter
    }

    pub async fn dispatch(
        &self,
        client: &Arc<ClientState>,
        req: RawRequest,
    ) -> io::Result<Vec<u8>> {
        let started = Instant::now();
        let cmd_name = req.command_name().to_string();
        let modify = self.registry.is_write_command(&cmd_name);
        let req_number = self.next_request_number();

        if let Some(op_log) = &self.op_log {
            // request records are best-effort
            let _ = op_log.log_request(req_number, modify, &req.exact);
        }

        let mut ctx = CmdContext {
            response: serde_json::Map::new(),
            client: Arc::clone(client),
            store_set: Arc::clone(&self.store_set),
            clients: Arc::clone(&self.clients),
            values: Default::default(),
            req,
            help: Vec::new(),
        };

        match self.registry.get(&cmd_name) {
            None => {
                debug!(command = %cmd_name, "unsupported command rejected");
                ctx.response.insert(
                    "error".to_string(),
                    serde_json::Value::String(format!("unsupported command '{cmd_name}'")),
                );
            }
            Some(def) => match parse_argv(def, &ctx.req) {
                Err(e) => {
                    ctx.response.insert(
                        "error".to_string(),
                        serde_json::Value::String(e.to_string()),
                    );
                }
                Ok(values) => {
                    ctx.values = values;
                    if cmd_name == "help" {
                        ctx.help = self.registry.summary();
                    }
                    if let Err(e) = (def.handler)(&mut ctx).await {
                        debug!(command = %cmd_name, error = %e, "handler error");
                        ctx.response.insert(
                            "error".to_string(),
                            serde_json::Value::String(e.to_string()),
                        );
                    }
                }
            },
        }

        let output = serde_json::to_vec(&ctx.response).map_err(|e| {
            error!(command = %cmd_name, error = %e, "unable to marshal response");
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?;

        if let Some(op_log) = &self.op_log {
            op_log.log_result(req_number, modify, &output)?;
        }

        metrics::counter!("treekv_commands_total", "command" => cmd_name.clone()).increment(1);
        metrics::histogram!("treekv_command_duration_seconds", "command" => cmd_name)
            .record(started.elapsed().as_secs_f64());
        trace!(response = %String::from_utf8_lossy(&output), "response");
        Ok(output)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
