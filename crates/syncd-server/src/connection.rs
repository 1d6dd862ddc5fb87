//! One sync connection.
//!
//! A connection task owns a transport and demultiplexes decoded messages
//! into its sessions. Outgoing traffic is strictly ordered: an enlistment
//! FIFO of sessions, each producing at most one frame per turn, with one
//! write in flight at a time.
//!
//! Error handling follows the taxonomy: session-level errors stay inside
//! the session; connection-level errors soft-close (single ERROR frame,
//! then a bounded wait for the peer to close); transport errors skip the
//! ERROR frame and destroy the connection outright.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info_span, trace, warn, Instrument};

use syncd_core::ports::metrics::names;
use syncd_core::ports::transport::Transport;
use syncd_core::protocol::wire;
use syncd_core::{ClientMessage, ProtocolError, ServerMessage, SessionIdent, Timestamp};

use crate::server::SyncServer;
use crate::session::handle::{ConnId, ConnSignal, SessionEvent, SessionHandle};
use crate::session::Session;

/// Interval of the idle/soft-close reaper tick.
const REAPER_TICK: Duration = Duration::from_secs(1);

struct SoftClose {
    error: ProtocolError,
    session_ident: SessionIdent,
    frame_sent: bool,
    deadline: Instant,
}

/// One connection and its sessions.
pub struct Connection {
    id: ConnId,
    server: Arc<SyncServer>,
    transport: Box<dyn Transport>,
    sessions: HashMap<SessionIdent, Session>,
    /// Enlistment FIFO; sessions in here have a send turn coming.
    enlist_queue: VecDeque<SessionIdent>,
    enlisted: std::collections::HashSet<SessionIdent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ctl_tx: mpsc::UnboundedSender<ConnSignal>,
    ctl_rx: mpsc::UnboundedReceiver<ConnSignal>,
    pending_pongs: VecDeque<Timestamp>,
    ping_count: u64,
    last_activity: Instant,
    soft_close: Option<SoftClose>,
}

impl Connection {
    pub fn new(id: ConnId, server: Arc<SyncServer>, transport: Box<dyn Transport>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        Self {
            id,
            server,
            transport,
            sessions: HashMap::new(),
            enlist_queue: VecDeque::new(),
            enlisted: std::collections::HashSet::new(),
            events_tx,
            events_rx,
            ctl_tx,
            ctl_rx,
            pending_pongs: VecDeque::new(),
            ping_count: 0,
            last_activity: Instant::now(),
            soft_close: None,
        }
    }

    /// Control channel used by the server root for zombie termination and
    /// shutdown.
    pub fn ctl_sender(&self) -> mpsc::UnboundedSender<ConnSignal> {
        self.ctl_tx.clone()
    }

    /// Spawn the connection task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let span = info_span!("conn", conn_id = self.id);
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(mut self) {
        self.server
            .metrics()
            .gauge_add(names::CONNECTIONS_ONLINE, 1.0);
        let mut tick = tokio::time::interval(REAPER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                frame = self.transport.recv_frame() => match frame {
                    Ok(Some(bytes)) => Some(Input::Frame(bytes)),
                    Ok(None) => None,
                    Err(err) => {
                        debug!(error = %err, "transport error");
                        None
                    }
                },
                Some(event) = self.events_rx.recv() => Some(Input::Event(event)),
                Some(signal) = self.ctl_rx.recv() => Some(Input::Ctl(signal)),
                _ = tick.tick() => Some(Input::Tick),
            };

            let Some(event) = event else {
                break;
            };
            let keep_going = match event {
                Input::Frame(bytes) => {
                    self.last_activity = Instant::now();
                    if let Err(err) = self.handle_frame(&bytes) {
                        self.initiate_soft_close(err, 0);
                    }
                    true
                }
                Input::Event(event) => {
                    self.handle_session_event(event);
                    true
                }
                Input::Ctl(ConnSignal::Terminate) => {
                    debug!("connection terminated as zombie");
                    false
                }
                Input::Tick => self.handle_tick(),
            };
            if !keep_going {
                break;
            }
            if self.pump().await.is_err() {
                break;
            }
        }

        self.teardown().await;
    }

    // ── Incoming ────────────────────────────────────────────────────────────

    fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if self.soft_close.is_some() {
            // Draining: the peer's remaining frames are ignored.
            return Ok(());
        }
        let message = wire::decode_client_message(bytes).map_err(ProtocolError::from)?;
        trace!(message = message.name(), "received");
        match message {
            ClientMessage::Ping { timestamp, rtt } => {
                self.ping_count += 1;
                if self.ping_count >= 2 {
                    self.server
                        .metrics()
                        .timing(names::PING_RTT, Duration::from_millis(rtt));
                }
                self.pending_pongs.push_back(timestamp);
                Ok(())
            }
            ClientMessage::Bind {
                session_ident,
                path,
                signed_user_token,
                need_client_file_ident,
                is_subserver,
            } => {
                if session_ident == 0 {
                    return Err(ProtocolError::BadSessionIdent);
                }
                if self.sessions.contains_key(&session_ident) {
                    return Err(ProtocolError::ReuseOfSessionIdent);
                }
                let mut session = Session::new(self.id, session_ident);
                let handle = SessionHandle::new(
                    self.id,
                    session_ident,
                    self.events_tx.clone(),
                    self.ctl_tx.clone(),
                );
                session.handle_bind(
                    &self.server,
                    handle,
                    &path,
                    &signed_user_token,
                    need_client_file_ident,
                    is_subserver,
                )?;
                self.server.metrics().gauge_add(names::SESSIONS_ONLINE, 1.0);
                let enlist = session.take_enlist_request();
                self.sessions.insert(session_ident, session);
                if enlist {
                    self.enlist(session_ident);
                }
                Ok(())
            }
            ClientMessage::Ident {
                session_ident,
                client_file_ident,
                client_file_ident_salt,
                scan_server_version,
                scan_client_version,
                latest_server_version,
                latest_server_version_salt,
            } => {
                let handle = SessionHandle::new(
                    self.id,
                    session_ident,
                    self.events_tx.clone(),
                    self.ctl_tx.clone(),
                );
                let server = Arc::clone(&self.server);
                self.with_session(session_ident, |session| {
                    session.handle_ident(
                        &server,
                        &handle,
                        client_file_ident,
                        client_file_ident_salt,
                        scan_server_version,
                        scan_client_version,
                        latest_server_version,
                        latest_server_version_salt,
                    )
                })
            }
            ClientMessage::Upload {
                session_ident,
                progress_client_version,
                progress_server_version,
                locked_server_version,
                changesets,
            } => self.with_session(session_ident, |session| {
                session.handle_upload(
                    progress_client_version,
                    progress_server_version,
                    locked_server_version,
                    changesets,
                )
            }),
            ClientMessage::Mark {
                session_ident,
                request_ident,
            } => self.with_session(session_ident, |session| session.handle_mark(request_ident)),
            ClientMessage::Unbind { session_ident } => {
                let Some(session) = self.sessions.get_mut(&session_ident) else {
                    return Err(ProtocolError::BadSessionIdent);
                };
                if session.handle_unbind() {
                    self.destroy_session(session_ident);
                } else if self
                    .sessions
                    .get_mut(&session_ident)
                    .is_some_and(Session::take_enlist_request)
                {
                    self.enlist(session_ident);
                }
                Ok(())
            }
        }
    }

    fn with_session(
        &mut self,
        session_ident: SessionIdent,
        f: impl FnOnce(&mut Session) -> Result<(), ProtocolError>,
    ) -> Result<(), ProtocolError> {
        let Some(session) = self.sessions.get_mut(&session_ident) else {
            return Err(ProtocolError::BadSessionIdent);
        };
        f(session)?;
        if session.take_enlist_request() {
            self.enlist(session_ident);
        }
        Ok(())
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        if self.soft_close.is_some() {
            return;
        }
        let Some(session) = self.sessions.get_mut(&event.session_ident) else {
            return;
        };
        session.apply_signal(event.signal);
        if session.take_enlist_request() {
            self.enlist(event.session_ident);
        }
    }

    /// Reaper: idle and soft-close deadlines. Returns false to destroy.
    fn handle_tick(&mut self) -> bool {
        if let Some(soft_close) = &self.soft_close {
            if Instant::now() >= soft_close.deadline {
                debug!("soft close deadline passed");
                return false;
            }
            return true;
        }
        let timeout = self.server.config().effective_heartbeat_timeout();
        if self.last_activity.elapsed() > timeout {
            debug!("connection idle past heartbeat timeout");
            return false;
        }
        true
    }

    // ── Outgoing ────────────────────────────────────────────────────────────

    fn enlist(&mut self, session_ident: SessionIdent) {
        if self.enlisted.insert(session_ident) {
            self.enlist_queue.push_back(session_ident);
        }
    }

    /// Drain pongs, the soft-close ERROR frame, and the enlistment queue.
    async fn pump(&mut self) -> Result<(), ()> {
        while let Some(timestamp) = self.pending_pongs.pop_front() {
            self.send(&ServerMessage::Pong { timestamp }).await?;
        }

        if self.soft_close.is_some() {
            let unsent = self.soft_close.as_mut().and_then(|soft_close| {
                if soft_close.frame_sent {
                    None
                } else {
                    soft_close.frame_sent = true;
                    Some((soft_close.error, soft_close.session_ident))
                }
            });
            if let Some((error, session_ident)) = unsent {
                let message = ServerMessage::Error {
                    session_ident,
                    error_code: error.code(),
                    message: error.to_string(),
                    try_again: error.try_again(),
                };
                self.send(&message).await?;
                // A connection-level error cascades: every session dies
                // once the ERROR frame is out.
                let idents: Vec<SessionIdent> = self.sessions.keys().copied().collect();
                for ident in idents {
                    self.destroy_session(ident);
                }
            }
            return Ok(());
        }

        while let Some(session_ident) = self.enlist_queue.pop_front() {
            self.enlisted.remove(&session_ident);
            let Some(session) = self.sessions.get_mut(&session_ident) else {
                continue;
            };
            let outcome = session.produce_frame();
            if let Some(message) = outcome.message {
                if matches!(message, ServerMessage::Download { .. }) {
                    self.server
                        .metrics()
                        .increment(names::DOWNLOAD_MESSAGES_SENT, 1);
                }
                self.send(&message).await?;
            }
            if outcome.reenlist {
                self.enlist(session_ident);
            }
            if outcome.destroy {
                self.destroy_session(session_ident);
            }
        }
        Ok(())
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), ()> {
        trace!(message = message.name(), "sending");
        let frame = wire::encode_server_message(message);
        self.transport.send_frame(frame).await.map_err(|err| {
            debug!(error = %err, "write failed");
        })
    }

    fn initiate_soft_close(&mut self, error: ProtocolError, session_ident: SessionIdent) {
        if self.soft_close.is_some() {
            return;
        }
        warn!(error = %error, code = error.code(), "connection error; soft closing");
        self.pending_pongs.clear();
        self.enlist_queue.clear();
        self.enlisted.clear();
        self.soft_close = Some(SoftClose {
            error,
            session_ident,
            frame_sent: false,
            deadline: Instant::now() + self.server.config().effective_soft_close_timeout(),
        });
    }

    fn destroy_session(&mut self, session_ident: SessionIdent) {
        if let Some(mut session) = self.sessions.remove(&session_ident) {
            session.detach();
            self.server
                .metrics()
                .gauge_add(names::SESSIONS_ONLINE, -1.0);
        }
        self.enlisted.remove(&session_ident);
    }

    async fn teardown(mut self) {
        let idents: Vec<SessionIdent> = self.sessions.keys().copied().collect();
        for ident in idents {
            self.destroy_session(ident);
        }
        self.transport.close().await;
        self.server
            .metrics()
            .gauge_add(names::CONNECTIONS_ONLINE, -1.0);
        self.server.unregister_connection(self.id);
        debug!("connection closed");
    }
}

enum Input {
    Frame(Vec<u8>),
    Event(SessionEvent),
    Ctl(ConnSignal),
    Tick,
}
