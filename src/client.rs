//! Relay client: membership, signaling and the fallback action path.
//!
//! `connect()` registers with the relay on the calling thread, then a
//! background reader thread long-polls the participant's mailbox and pushes
//! every event into an `mpsc` channel. The session controller drains that
//! channel with `poll()` from its own loop, so it never blocks on the relay
//! except for the short request/reply calls (join, signal, action, leave).
//!
//! Relay loss is sticky: once a request or a poll fails the client reports
//! itself disconnected and does not reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::model::descriptor::NetworkDescriptor;
use crate::model::payload::ActionEnvelope;
use crate::model::session::{ParticipantId, SessionId};
use crate::model::wire::{
    ActionRequest, ConnectReply, JoinReply, JoinRequest, RelayEvent, SignalRequest,
};

/// What the reader thread hands to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotice {
    Event(RelayEvent),
    /// The relay stopped answering. No further notices follow.
    Disconnected(String),
}

/// The relay operations the session controller depends on.
pub trait RelayPort {
    fn local_id(&self) -> ParticipantId;

    fn is_connected(&self) -> bool;

    /// Request membership in `session`; returns the member count.
    fn join_session(&mut self, session: &SessionId) -> Result<usize>;

    /// Best-effort, unacknowledged forward of one descriptor.
    fn send_negotiation(&mut self, target: ParticipantId, descriptor: &NetworkDescriptor)
        -> Result<()>;

    /// Fallback path for game actions.
    fn send_action(&mut self, session: &SessionId, envelope: &ActionEnvelope) -> Result<()>;

    /// Drain whatever arrived since the last call, without blocking.
    fn poll(&mut self) -> Vec<RelayNotice>;

    fn leave(&mut self);
}

pub struct RelayClient {
    http: Client,
    config: ClientConfig,
    id: ParticipantId,
    inbox: Receiver<RelayNotice>,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    _reader_thread: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Register with the relay and start the reader thread.
    ///
    /// Fails with `Error::Connection` when the relay is unreachable.
    pub fn connect(config: ClientConfig) -> Result<RelayClient> {
        let http = Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;

        let reply: ConnectReply = http
            .post(format!("{}/connect", config.relay_url))
            .timeout(config.request_timeout)
            .send()
            .and_then(Response::error_for_status)
            .and_then(Response::json)
            .map_err(|e| Error::Connection(format!("connect to {}: {e}", config.relay_url)))?;

        let id = reply.participant_id;
        info!("Connected to relay {} as {}", config.relay_url, id);

        let connected = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let reader = PollLoop {
            http: http.clone(),
            url: format!(
                "{}/poll/{}?wait_ms={}",
                config.relay_url,
                id.0,
                config.poll_wait.as_millis()
            ),
            timeout: config.poll_wait + Duration::from_secs(10),
            tx,
            connected: connected.clone(),
            stop: stop.clone(),
        };
        let reader_thread = thread::spawn(move || reader.run());

        Ok(RelayClient {
            http,
            config,
            id,
            inbox: rx,
            connected,
            stop,
            _reader_thread: Some(reader_thread),
        })
    }

    fn post<B: Serialize>(&self, endpoint: &str, body: &B) -> Result<Response> {
        if !self.is_connected() {
            return Err(Error::Connection("relay connection lost".into()));
        }

        let url = format!("{}/{}/{}", self.config.relay_url, endpoint, self.id.0);
        match self
            .http
            .post(url)
            .json(body)
            .timeout(self.config.request_timeout)
            .send()
        {
            Ok(response) => Ok(response),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(Error::Connection(format!("{endpoint}: {e}")))
            }
        }
    }
}

impl RelayPort for RelayClient {
    fn local_id(&self) -> ParticipantId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn join_session(&mut self, session: &SessionId) -> Result<usize> {
        let response = self.post(
            "join",
            &JoinRequest {
                session_id: session.clone(),
            },
        )?;

        if response.status() == StatusCode::CONFLICT {
            return Err(Error::SessionFull(session.to_string()));
        }

        let reply: JoinReply = response
            .error_for_status()
            .and_then(Response::json)
            .map_err(|e| Error::Connection(format!("join: {e}")))?;

        info!("Joined session {} ({}/2)", session, reply.count);
        Ok(reply.count)
    }

    fn send_negotiation(
        &mut self,
        target: ParticipantId,
        descriptor: &NetworkDescriptor,
    ) -> Result<()> {
        let body = SignalRequest {
            target,
            signal: descriptor.clone(),
        };
        self.post("signal", &body)?
            .error_for_status()
            .map_err(|e| Error::Connection(format!("signal: {e}")))?;

        debug!("Sent {} to {}", descriptor.kind(), target);
        Ok(())
    }

    fn send_action(&mut self, session: &SessionId, envelope: &ActionEnvelope) -> Result<()> {
        let body = ActionRequest::new(session.clone(), envelope);
        self.post("action", &body)?
            .error_for_status()
            .map_err(|e| Error::Connection(format!("action: {e}")))?;
        Ok(())
    }

    fn poll(&mut self) -> Vec<RelayNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.inbox.try_recv() {
            notices.push(notice);
        }
        notices
    }

    fn leave(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if self.is_connected() {
            if let Err(e) = self.post("leave", &Value::Null) {
                debug!("Leave request failed: {}", e);
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        // The reader thread notices on its next poll round.
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Background long-poll over the participant's mailbox.
struct PollLoop {
    http: Client,
    url: String,
    timeout: Duration,
    tx: Sender<RelayNotice>,
    connected: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl PollLoop {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            let batch: Vec<Value> = match self
                .http
                .get(&self.url)
                .timeout(self.timeout)
                .send()
                .and_then(Response::error_for_status)
                .and_then(Response::json)
            {
                Ok(batch) => batch,
                Err(e) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!("Relay poll failed: {}", e);
                    self.connected.store(false, Ordering::SeqCst);
                    let _ = self.tx.send(RelayNotice::Disconnected(e.to_string()));
                    break;
                }
            };

            for value in batch {
                match serde_json::from_value::<RelayEvent>(value) {
                    Ok(event) => {
                        if self.tx.send(RelayNotice::Event(event)).is_err() {
                            // The client was dropped.
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping malformed relay event: {}", e),
                }
            }
        }
    }
}
