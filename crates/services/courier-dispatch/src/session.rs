use crate::fleet::FleetDirectory;
use crate::metrics;
use courier_types::{AgentStatus, ChannelId, CourierId, Participant};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

struct Session {
    participant: Participant,
    channels: HashSet<ChannelId>,
}

struct Registry {
    sessions: Mutex<HashMap<Uuid, Session>>,
    fleet: Arc<dyn FleetDirectory>,
}

/// Live sessions and the channels each one listens on.
///
/// Sessions are only reachable through a [`SessionGuard`]; dropping the guard
/// is the one way a session ends.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Registry>,
}

impl SessionRegistry {
    pub fn new(fleet: Arc<dyn FleetDirectory>) -> Self {
        Self {
            inner: Arc::new(Registry {
                sessions: Mutex::new(HashMap::new()),
                fleet,
            }),
        }
    }

    /// Registers a session subscribed to the participant's own channel.
    /// A courier coming online becomes available for offers.
    pub async fn open(&self, participant: Participant) -> SessionGuard {
        let id = Uuid::new_v4();
        let count = {
            let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.insert(
                id,
                Session {
                    participant,
                    channels: HashSet::from([participant.channel()]),
                },
            );
            sessions.len()
        };
        metrics::update_live_sessions(count);
        tracing::info!("Session {} opened for {}", id, participant);

        if let Participant::Courier(courier_id) = participant {
            if let Err(e) = self.inner.fleet.set_status(courier_id, AgentStatus::Available).await {
                tracing::warn!("Courier {} connected but could not be marked available: {}", courier_id, e);
            }
        }

        SessionGuard {
            id,
            participant,
            registry: self.clone(),
        }
    }

    fn channels_of(&self, session_id: Uuid) -> Vec<ChannelId> {
        let sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut channels: Vec<_> = sessions
            .get(&session_id)
            .map(|s| s.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub fn is_connected(&self, participant: Participant) -> bool {
        let sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.values().any(|s| s.participant == participant)
    }

    /// Removes the session. Returns the courier whose last session this was.
    fn close(&self, session_id: Uuid) -> Option<CourierId> {
        let mut sessions = self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let session = sessions.remove(&session_id)?;
        metrics::update_live_sessions(sessions.len());
        tracing::info!("Session {} closed for {}", session_id, session.participant);

        match session.participant {
            Participant::Courier(courier_id) => {
                let still_connected = sessions
                    .values()
                    .any(|s| s.participant == Participant::Courier(courier_id));
                (!still_connected).then_some(courier_id)
            }
            Participant::Merchant(_) | Participant::Customer(_) => None,
        }
    }
}

/// Keeps a session registered for as long as it lives.
pub struct SessionGuard {
    id: Uuid,
    participant: Participant,
    registry: SessionRegistry,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn participant(&self) -> Participant {
        self.participant
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.registry.channels_of(self.id)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(courier_id) = self.registry.close(self.id) else {
            return;
        };
        let registry = self.registry.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { registry.take_offline(courier_id).await });
            }
            Err(_) => tracing::warn!(
                "No runtime to mark courier {} offline after its last session ended",
                courier_id
            ),
        }
    }
}

impl SessionRegistry {
    /// Marks a courier offline after its last session ended, unless it has
    /// reconnected in the meantime.
    ///
    /// `open` registers the session before marking the courier available, so
    /// a reconnect racing the offline write is seen by the second check.
    async fn take_offline(&self, courier_id: CourierId) {
        let participant = Participant::Courier(courier_id);
        if self.is_connected(participant) {
            tracing::debug!("Courier {} reconnected before going offline", courier_id);
            return;
        }
        let fleet = &self.inner.fleet;
        match fleet.set_status(courier_id, AgentStatus::Offline).await {
            Ok(_) if self.is_connected(participant) => {
                if let Err(e) = fleet.set_status(courier_id, AgentStatus::Available).await {
                    tracing::debug!("Courier {} reconnected but stays as is: {}", courier_id, e);
                }
            }
            Ok(_) => tracing::info!("Courier {} went offline", courier_id),
            // A busy courier keeps its job across reconnects
            Err(e) => tracing::debug!("Courier {} left without going offline: {}", courier_id, e),
        }
    }
}
