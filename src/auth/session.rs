//! Observable session state.
//!
//! The current [`Session`] lives in a `watch` channel so readers always see
//! the latest snapshot; every transition is also published on a `broadcast`
//! channel so a subscriber sees each sign-in and sign-out in order, even if
//! it is slow to poll.

use futures::stream::{self, Stream};
use tokio::sync::{broadcast, watch};

use super::types::Session;

/// Buffered transitions per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 32;

pub struct SessionState {
    snapshot: watch::Sender<Session>,
    events: broadcast::Sender<Session>,
}

impl SessionState {
    /// Start unauthenticated
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Session::unauthenticated());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { snapshot, events }
    }

    /// Current session snapshot
    pub fn current(&self) -> Session {
        self.snapshot.borrow().clone()
    }

    /// Stream of session transitions, starting after the call
    ///
    /// Never ends while the pipeline is alive; drop it to unsubscribe. A
    /// subscriber that falls more than the buffer behind skips straight to
    /// the newest snapshot.
    pub fn changes(&self) -> impl Stream<Item = Session> + Send + 'static {
        let rx = self.events.subscribe();
        let latest = self.snapshot.subscribe();

        stream::unfold((rx, latest), |(mut rx, latest)| async move {
            match rx.recv().await {
                Ok(session) => Some((session, (rx, latest))),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Session subscriber lagged, resyncing");
                    let session = latest.borrow().clone();
                    Some((session, (rx.resubscribe(), latest)))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
    }

    /// Recompute from the credential store's contents
    ///
    /// Only the credential store calls this. Returns whether anything changed.
    pub(crate) fn recompute(&self, has_credential: bool, identity: Option<String>) -> bool {
        let next = if has_credential {
            Session::authenticated(identity)
        } else {
            Session::unauthenticated()
        };

        let changed = self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });

        if changed {
            tracing::info!(
                authenticated = next.is_authenticated,
                identity = next.identity.as_deref().unwrap_or("-"),
                "Session changed"
            );
            // No subscribers is fine
            let _ = self.events.send(next);
        }

        changed
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
