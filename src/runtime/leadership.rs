use std::sync::Arc;

use tokio::sync::watch;

/// Consumer side of a leader election.
///
/// The election itself runs elsewhere; it publishes whether this process
/// currently holds the lock. A coordinator that goes away counts as lost
/// leadership.
#[derive(Clone, Debug)]
pub struct Leadership {
    rx: watch::Receiver<bool>,
    // keeps a standalone channel open
    _tx: Option<Arc<watch::Sender<bool>>>,
}

/// Producer side, held by the election implementation
#[derive(Debug)]
pub struct LeadershipHandle {
    tx: watch::Sender<bool>,
}

impl LeadershipHandle {
    pub fn set_leader(&self, leader: bool) {
        self.tx.send_replace(leader);
    }
}

impl Leadership {
    /// A process that is the only instance, and so always the leader
    pub fn standalone() -> Self {
        let (tx, rx) = watch::channel(true);
        Self {
            rx,
            _tx: Some(Arc::new(tx)),
        }
    }

    /// A channel starting as follower
    pub fn channel() -> (LeadershipHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (LeadershipHandle { tx }, Self::from_receiver(rx))
    }

    pub fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        Self { rx, _tx: None }
    }

    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until this process becomes leader. Returns false if the
    /// coordinator went away first.
    pub async fn acquired(&mut self) -> bool {
        self.rx.wait_for(|leader| *leader).await.is_ok()
    }

    /// Wait until leadership is revoked or the coordinator went away
    pub async fn lost(&mut self) {
        let _ = self.rx.wait_for(|leader| !*leader).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn standalone_is_always_leader() {
        let mut leadership = Leadership::standalone();
        assert!(leadership.is_leader());
        assert!(leadership.acquired().await);
        let lost = tokio::time::timeout(Duration::from_millis(50), leadership.lost()).await;
        assert!(lost.is_err());
    }

    #[tokio::test]
    async fn follows_coordinator() {
        let (handle, mut leadership) = Leadership::channel();
        assert!(!leadership.is_leader());

        handle.set_leader(true);
        assert!(leadership.acquired().await);
        assert!(leadership.is_leader());

        let waiter = tokio::spawn(async move { leadership.lost().await });
        handle.set_leader(false);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_coordinator_means_lost() {
        let (handle, mut leadership) = Leadership::channel();
        drop(handle);
        assert!(!leadership.acquired().await);
        leadership.lost().await;
    }
}
