//! Mock transport for exercising the connection lifecycle
//!
//! Scripts a sequence of connect outcomes (dial failures, handshake
//! rejections, working sessions) so lifecycle tests can drive reconnection
//! without a network.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{HandshakeResponse, MasqueTransport, TunnelSession};
use crate::error::{Error, Result};
use crate::session::MemoryIpSession;

/// One scripted outcome for a connect attempt.
pub enum MockOutcome {
    /// The dial itself fails.
    DialError(String),
    /// The proxy answers with a non-200 status.
    Rejected(u16, &'static str),
    /// The dial succeeds and yields this session.
    Session(Arc<MemoryIpSession>),
}

/// Transport double replaying scripted outcomes in order.
///
/// Once the script is exhausted every further attempt yields a fresh echo
/// session, so reconnect loops keep making progress.
pub struct MockTransport {
    script: Mutex<VecDeque<MockOutcome>>,
    attempts: AtomicUsize,
    sessions: Mutex<Vec<Arc<MemoryIpSession>>>,
}

impl MockTransport {
    pub fn new(script: Vec<MockOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Number of connect attempts observed so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Every session handed out, in connect order.
    pub fn sessions(&self) -> Vec<Arc<MemoryIpSession>> {
        self.sessions.lock().expect("mock poisoned").clone()
    }

    /// Wait until `count` connect attempts have been made.
    pub async fn wait_attempts(&self, count: usize) {
        while self.attempts() < count {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl MasqueTransport for MockTransport {
    async fn connect(&self, _endpoint: SocketAddr) -> Result<TunnelSession> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().expect("mock poisoned").pop_front();
        match outcome {
            Some(MockOutcome::DialError(reason)) => Err(Error::Dial(reason)),
            Some(MockOutcome::Rejected(status, reason)) => {
                let session = Arc::new(MemoryIpSession::new());
                self.sessions.lock().expect("mock poisoned").push(session.clone());
                Ok(TunnelSession {
                    ip: session,
                    response: HandshakeResponse {
                        status,
                        reason: reason.into(),
                    },
                })
            }
            Some(MockOutcome::Session(session)) => {
                self.sessions.lock().expect("mock poisoned").push(session.clone());
                Ok(TunnelSession {
                    ip: session,
                    response: HandshakeResponse::ok(),
                })
            }
            None => {
                let session = Arc::new(MemoryIpSession::echo());
                self.sessions.lock().expect("mock poisoned").push(session.clone());
                Ok(TunnelSession {
                    ip: session,
                    response: HandshakeResponse::ok(),
                })
            }
        }
    }
}
