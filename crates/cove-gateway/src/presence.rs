use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

/// Typing state per (user, conversation): last-write-wins timestamps
/// expired by a periodic sweep, never by explicit cancel. Online state
/// is not held here at all — it is derived from the connection registry
/// on demand, so there is no stored flag to go stale.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    typing_ttl: Duration,
    typing: Mutex<HashMap<(Uuid, Uuid), Instant>>,
}

impl PresenceTracker {
    pub fn new(typing_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                typing_ttl,
                typing: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn note_typing(&self, user_id: Uuid, conversation_id: Uuid) {
        self.inner
            .typing
            .lock()
            .expect("typing lock poisoned")
            .insert((user_id, conversation_id), Instant::now());
    }

    /// Users currently typing in a conversation (entries within TTL).
    pub fn typing_users(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let cutoff = Instant::now() - self.inner.typing_ttl;
        self.inner
            .typing
            .lock()
            .expect("typing lock poisoned")
            .iter()
            .filter(|((_, convo), at)| *convo == conversation_id && **at >= cutoff)
            .map(|((user, _), _)| *user)
            .collect()
    }

    /// Drop every typing entry for a user, e.g. when their last
    /// connection goes away.
    pub fn clear_user(&self, user_id: Uuid) {
        self.inner
            .typing
            .lock()
            .expect("typing lock poisoned")
            .retain(|(user, _), _| *user != user_id);
    }

    /// Remove expired entries. Driven by an interval task in the server
    /// binary; typing indicators decay even if the client never sends a
    /// stop signal.
    pub fn sweep(&self) {
        let cutoff = Instant::now() - self.inner.typing_ttl;
        let mut typing = self.inner.typing.lock().expect("typing lock poisoned");
        let before = typing.len();
        typing.retain(|_, at| *at >= cutoff);
        if typing.len() != before {
            debug!(expired = before - typing.len(), "typing entries swept");
        }
    }
}

/// Run the typing sweep once a second until the tracker is dropped.
pub fn spawn_typing_sweeper(tracker: PresenceTracker) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            tracker.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_expires_after_ttl() {
        let tracker = PresenceTracker::new(Duration::from_millis(10));
        let user = Uuid::new_v4();
        let convo = Uuid::new_v4();

        tracker.note_typing(user, convo);
        assert_eq!(tracker.typing_users(convo), vec![user]);

        std::thread::sleep(Duration::from_millis(20));
        assert!(tracker.typing_users(convo).is_empty());

        tracker.sweep();
        assert!(tracker.inner.typing.lock().unwrap().is_empty());
    }

    #[test]
    fn typing_is_last_write_wins_per_user_and_conversation() {
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let user = Uuid::new_v4();
        let convo = Uuid::new_v4();

        tracker.note_typing(user, convo);
        tracker.note_typing(user, convo);
        assert_eq!(tracker.typing_users(convo).len(), 1);

        tracker.clear_user(user);
        assert!(tracker.typing_users(convo).is_empty());
    }
}
