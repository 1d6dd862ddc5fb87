//! Handles through which coordinators reach sessions.
//!
//! The coordinator never owns a session; it holds a [`SessionHandle`] that
//! can only push signals into the owning connection's event queue. The
//! connection task applies the signal to the session on its next turn,
//! which keeps every session mutation on its owner.

use tokio::sync::mpsc;

use syncd_core::{ProtocolError, SaltedFileIdent, SessionIdent};

/// Identifier of one connection within the process.
pub type ConnId = u64;

/// Signal delivered to a session through its connection.
#[derive(Debug)]
pub enum SessionSignal {
    /// New downloadable history exists; re-enlist for sending.
    Resume,
    /// The session's file-ident allocation completed.
    IdentAllocated(SaltedFileIdent),
    /// Drive the session through its error path.
    Error(ProtocolError),
}

/// Signal addressed to a connection as a whole.
#[derive(Debug)]
pub enum ConnSignal {
    /// Tear the connection down without an ERROR frame. Sent when another
    /// connection takes over one of its client files (zombie takeover).
    Terminate,
}

/// A session signal together with its target session.
#[derive(Debug)]
pub struct SessionEvent {
    pub session_ident: SessionIdent,
    pub signal: SessionSignal,
}

/// Address of one session, held by file coordinators.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    conn_id: ConnId,
    session_ident: SessionIdent,
    events: mpsc::UnboundedSender<SessionEvent>,
    conn_ctl: mpsc::UnboundedSender<ConnSignal>,
}

impl SessionHandle {
    pub fn new(
        conn_id: ConnId,
        session_ident: SessionIdent,
        events: mpsc::UnboundedSender<SessionEvent>,
        conn_ctl: mpsc::UnboundedSender<ConnSignal>,
    ) -> Self {
        Self {
            conn_id,
            session_ident,
            events,
            conn_ctl,
        }
    }

    pub const fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub const fn session_ident(&self) -> SessionIdent {
        self.session_ident
    }

    /// Push a signal; a send failure means the connection is already gone,
    /// which every caller treats as "session no longer bound".
    pub fn signal(&self, signal: SessionSignal) {
        let _ = self.events.send(SessionEvent {
            session_ident: self.session_ident,
            signal,
        });
    }

    /// Terminate the whole owning connection.
    pub fn terminate_connection(&self) {
        let _ = self.conn_ctl.send(ConnSignal::Terminate);
    }

    /// True when `other` addresses the same session on the same connection.
    pub fn same_session(&self, conn_id: ConnId, session_ident: SessionIdent) -> bool {
        self.conn_id == conn_id && self.session_ident == session_ident
    }
}
