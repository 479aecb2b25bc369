//! Push notifications from the engine to the UI layer.
//!
//! Every selected folder runs as a numbered session. Publishing is tagged
//! with the session number and dropped unless that session is still the
//! current one, so nothing from an abandoned folder reaches subscribers once
//! the switch has returned.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::display::DisplayRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LibraryEvent {
    #[serde(rename_all = "camelCase")]
    Added { record: DisplayRecord },
    #[serde(rename_all = "camelCase")]
    Removed { name: String, project_id: String },
}

pub type Subscription = mpsc::UnboundedReceiver<LibraryEvent>;

#[derive(Default)]
struct BusState {
    session: u64,
    subscribers: Vec<mpsc::UnboundedSender<LibraryEvent>>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// New receiver; dropping it unsubscribes.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.subscribers.push(tx);
        }
        rx
    }

    /// Invalidate the current session and return the number of the next one.
    pub(crate) fn begin_session(&self) -> u64 {
        match self.state.lock() {
            Ok(mut state) => {
                state.session += 1;
                state.session
            }
            Err(_) => 0,
        }
    }

    /// Deliver to every live subscriber if `session` is still current.
    pub(crate) fn publish(&self, session: u64, event: LibraryEvent) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.session != session {
            return false;
        }
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .map(|mut state| {
                state.subscribers.retain(|tx| !tx.is_closed());
                state.subscribers.len()
            })
            .unwrap_or(0)
    }
}
