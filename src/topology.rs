// ============================================================================
// TOPOLOGY FEED
// ============================================================================
// Boundary to the link-discovery collaborator. Discovery publishes link
// changes here; sampling and probing follow them. The engine registers the
// feed as the external `topology` capability.
// ============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::DatapathLink;
use crate::EVENT_CHANNEL_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "link", rename_all = "snake_case")]
pub enum TopologyEvent {
    LinkAdded(DatapathLink),
    LinkRemoved(DatapathLink),
}

/// Current link set plus a broadcast of its changes.
#[derive(Debug)]
pub struct TopologyFeed {
    links: RwLock<BTreeSet<DatapathLink>>,
    events: broadcast::Sender<TopologyEvent>,
}

impl Default for TopologyFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyFeed {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            links: RwLock::new(BTreeSet::new()),
            events,
        }
    }

    /// Apply and broadcast a change. Returns false if it changed nothing.
    pub fn publish(&self, event: TopologyEvent) -> bool {
        let changed = {
            let mut links = self.links.write();
            match event {
                TopologyEvent::LinkAdded(link) => links.insert(link),
                TopologyEvent::LinkRemoved(link) => links.remove(&link),
            }
        };
        if changed {
            debug!(target: "flowwatch::topology", ?event, "Topology changed");
            // No subscribers yet is fine; they seed from `links()`.
            let _ = self.events.send(event);
        }
        changed
    }

    pub fn add_link(&self, link: DatapathLink) -> bool {
        self.publish(TopologyEvent::LinkAdded(link))
    }

    pub fn remove_link(&self, link: DatapathLink) -> bool {
        self.publish(TopologyEvent::LinkRemoved(link))
    }

    pub fn links(&self) -> BTreeSet<DatapathLink> {
        self.links.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }
}

// ----------------------------------------------------------------------------
// Link Set
// ----------------------------------------------------------------------------

/// A component's own view of the known links, kept in step with a feed.
#[derive(Debug, Default)]
pub struct LinkSet {
    links: RwLock<BTreeSet<DatapathLink>>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: TopologyEvent) -> bool {
        let mut links = self.links.write();
        match event {
            TopologyEvent::LinkAdded(link) => links.insert(link),
            TopologyEvent::LinkRemoved(link) => links.remove(&link),
        }
    }

    pub fn replace(&self, links: BTreeSet<DatapathLink>) {
        *self.links.write() = links;
    }

    pub fn contains(&self, link: &DatapathLink) -> bool {
        self.links.read().contains(link)
    }

    pub fn snapshot(&self) -> Vec<DatapathLink> {
        self.links.read().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    /// Seed from `feed` and follow its changes until `shutdown` fires.
    /// `on_removed` runs for every link that disappears.
    pub fn spawn_follower<F>(
        self: &Arc<Self>,
        feed: Arc<TopologyFeed>,
        shutdown: CancellationToken,
        on_removed: F,
    ) -> JoinHandle<()>
    where
        F: Fn(DatapathLink) + Send + Sync + 'static,
    {
        let set = Arc::clone(self);
        // Subscribe before seeding so no change falls between the two.
        let mut rx = feed.subscribe();
        set.replace(feed.links());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            if set.apply(event) {
                                if let TopologyEvent::LinkRemoved(link) = event {
                                    on_removed(link);
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "flowwatch::topology", skipped, "Topology events lagged, resynchronizing");
                            set.replace(feed.links());
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_is_idempotent_and_broadcast() {
        let feed = TopologyFeed::new();
        let mut rx = feed.subscribe();
        let link: DatapathLink = "1[1]>2[1]".parse().unwrap();

        assert!(feed.add_link(link));
        assert!(!feed.add_link(link));
        assert!(feed.remove_link(link));

        assert_eq!(rx.recv().await.unwrap(), TopologyEvent::LinkAdded(link));
        assert_eq!(rx.recv().await.unwrap(), TopologyEvent::LinkRemoved(link));
        assert!(feed.links().is_empty());
    }

    #[tokio::test]
    async fn test_link_set_follows_feed() {
        let feed = Arc::new(TopologyFeed::new());
        let existing: DatapathLink = "1[1]>2[1]".parse().unwrap();
        let added: DatapathLink = "2[2]>3[1]".parse().unwrap();
        feed.add_link(existing);

        let set = Arc::new(LinkSet::new());
        let removed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        let shutdown = CancellationToken::new();
        let follower = set.spawn_follower(Arc::clone(&feed), shutdown.clone(), move |link| sink.lock().push(link));
        assert!(set.contains(&existing));

        feed.add_link(added);
        feed.remove_link(existing);
        for _ in 0..100 {
            if set.contains(&added) && !set.contains(&existing) {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(set.snapshot(), vec![added]);
        assert_eq!(*removed.lock(), vec![existing]);
        shutdown.cancel();
        follower.await.unwrap();
    }
}
