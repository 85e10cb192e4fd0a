//! Relay service.
//!
//! A rouille HTTP server in front of a single `Registry` guarded by a mutex.
//! Long-polls wait on a condvar that every mutation notifies, so a forwarded
//! descriptor or action reaches the waiting participant immediately. A
//! reaper thread drops participants that stopped polling.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rouille::{router, Request, Response, Server};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::model::registry::Registry;
use crate::model::session::ParticipantId;
use crate::model::wire::{
    ActionReply, ActionRequest, ConnectReply, JoinReply, JoinRequest, SignalRequest,
};

const REAP_INTERVAL: Duration = Duration::from_millis(500);

struct Relay {
    registry: Mutex<Registry>,
    wake: Condvar,
    config: RelayConfig,
}

impl Relay {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, request: &Request) -> Response {
        debug!("{} {}", request.method(), request.url());

        // No keep-alive: an idle connection would block `stop`.
        let response = router!(request,
            (GET) (/health) => {
                Response::text("ok")
            },
            (POST) (/connect) => {
                let participant_id = self.lock().connect(Instant::now());
                Response::json(&ConnectReply { participant_id })
            },
            (POST) (/join/{id: u64}) => {
                self.join(ParticipantId(id), request)
            },
            (GET) (/poll/{id: u64}) => {
                self.poll(ParticipantId(id), request)
            },
            (POST) (/signal/{id: u64}) => {
                self.signal(ParticipantId(id), request)
            },
            (POST) (/action/{id: u64}) => {
                self.action(ParticipantId(id), request)
            },
            (POST) (/leave/{id: u64}) => {
                self.lock().leave(ParticipantId(id));
                self.wake.notify_all();
                no_content()
            },
            _ => Response::empty_404()
        );
        response.with_additional_header("Connection", "close")
    }

    fn join(&self, id: ParticipantId, request: &Request) -> Response {
        let body: JoinRequest = match read_json(request) {
            Ok(body) => body,
            Err(response) => return response,
        };

        let result = self.lock().join(id, body.session_id);
        self.wake.notify_all();
        match result {
            Ok(count) => Response::json(&JoinReply { count }),
            Err(e) => error_response(&e),
        }
    }

    fn signal(&self, id: ParticipantId, request: &Request) -> Response {
        let body: SignalRequest = match read_json(request) {
            Ok(body) => body,
            Err(response) => return response,
        };

        let result = self.lock().signal(id, body.target, body.signal);
        self.wake.notify_all();
        match result {
            Ok(()) => no_content(),
            Err(e) => error_response(&e),
        }
    }

    fn action(&self, id: ParticipantId, request: &Request) -> Response {
        let body: ActionRequest = match read_json(request) {
            Ok(body) => body,
            Err(response) => return response,
        };

        let result = self.lock().action(id, body);
        self.wake.notify_all();
        match result {
            Ok(delivered) => Response::json(&ActionReply { delivered }),
            Err(e) => error_response(&e),
        }
    }

    /// Hold the request until the mailbox has something or the wait ends.
    fn poll(&self, id: ParticipantId, request: &Request) -> Response {
        let wait = request
            .get_param("wait_ms")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.config.poll_wait)
            .min(self.config.poll_wait);
        let deadline = Instant::now() + wait;

        let mut registry = self.lock();
        if !registry.is_connected(id) {
            return Response::empty_404();
        }

        registry.begin_poll(id);
        loop {
            if !registry.is_connected(id) || registry.has_pending(id) {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            registry = match self.wake.wait_timeout(registry, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let now = Instant::now();
        registry.end_poll(id, now);
        match registry.take(id, now) {
            Some(events) => Response::json(&events),
            None => Response::empty_404(),
        }
    }

    fn reap(&self) {
        let gone = self.lock().reap(Instant::now(), self.config.liveness);
        if !gone.is_empty() {
            self.wake.notify_all();
        }
    }
}

fn read_json<T: DeserializeOwned>(request: &Request) -> std::result::Result<T, Response> {
    rouille::input::json_input(request).map_err(|e| {
        warn!("Rejecting request body: {}", e);
        Response::text(e.to_string()).with_status_code(400)
    })
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::SessionFull(_) => 409,
        Error::Connection(_) => 404,
        _ => 400,
    };
    Response::text(error.to_string()).with_status_code(status)
}

fn no_content() -> Response {
    Response::text("").with_status_code(204)
}

/// Handle to a running relay.
pub struct RelayHandle {
    addr: SocketAddr,
    stop: Sender<()>,
    server_thread: JoinHandle<()>,
    keep_reaping: Arc<AtomicBool>,
}

impl RelayHandle {
    /// Base URL clients should use. A wildcard bind is reported as loopback.
    pub fn url(&self) -> String {
        let ip = if self.addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            self.addr.ip().to_string()
        };
        format!("http://{}:{}", ip, self.addr.port())
    }

    /// Block until the server thread exits.
    pub fn wait(self) {
        let _ = self.server_thread.join();
    }

    /// Stop accepting requests and wait for the listener to shut down.
    pub fn stop(self) {
        self.keep_reaping.store(false, Ordering::SeqCst);
        let _ = self.stop.send(());
        let _ = self.server_thread.join();
    }
}

/// Start the relay on background threads. Port 0 in `config.bind` lets the
/// OS pick a free port; read it back from the handle.
pub fn start_relay(config: RelayConfig) -> Result<RelayHandle> {
    let relay = Arc::new(Relay {
        registry: Mutex::new(Registry::new()),
        wake: Condvar::new(),
        config: config.clone(),
    });

    let handler = relay.clone();
    let server = Server::new(config.bind.as_str(), move |request| handler.handle(request))
        .map_err(|e| Error::Connection(format!("binding {}: {e}", config.bind)))?
        .pool_size(config.workers);

    let addr = server.server_addr();
    info!("Relay listening on {}", addr);

    let (server_thread, stop) = server.stoppable();

    let keep_reaping = Arc::new(AtomicBool::new(true));
    let reaping = keep_reaping.clone();
    thread::spawn(move || {
        while reaping.load(Ordering::SeqCst) {
            thread::sleep(REAP_INTERVAL);
            relay.reap();
        }
    });

    Ok(RelayHandle {
        addr,
        stop,
        server_thread,
        keep_reaping,
    })
}
