//! Refcounted pool of long-running per-peer workers.
//!
//! Used twice: once parameterized over outbound message queues, once over
//! response senders. All map mutation happens under one reader/writer lock;
//! worker startup and shutdown run outside the lock so a worker that touches
//! the pool during its lifecycle cannot deadlock it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use weave_core::PeerId;

/// A long-running process serving one peer.
pub trait PeerProcess: Send + Sync + 'static {
    fn startup(&self);
    fn shutdown(&self);
}

struct Instance<P> {
    refcount: usize,
    process: Arc<P>,
}

type Factory<P> = Box<dyn Fn(PeerId) -> Arc<P> + Send + Sync>;

pub struct PeerManager<P: PeerProcess> {
    processes: RwLock<HashMap<PeerId, Instance<P>>>,
    factory: Factory<P>,
}

impl<P: PeerProcess> PeerManager<P> {
    pub fn new(factory: impl Fn(PeerId) -> Arc<P> + Send + Sync + 'static) -> Self {
        PeerManager {
            processes: RwLock::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Peers currently mapped to a process.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.processes.read().keys().copied().collect()
    }

    /// Record a new connection to `peer`, creating and starting its process
    /// if this is the first reference.
    pub fn connected(&self, peer: PeerId) {
        let (process, created) = {
            let mut processes = self.processes.write();
            let instance = self.get_or_create(&mut processes, peer);
            instance.0.refcount += 1;
            (instance.0.process.clone(), instance.1)
        };
        if created {
            process.startup();
        }
    }

    /// Record a dropped connection. The process shuts down when the last
    /// reference goes away.
    pub fn disconnected(&self, peer: PeerId) {
        let process = {
            let mut processes = self.processes.write();
            let Some(instance) = processes.get_mut(&peer) else {
                return;
            };
            instance.refcount = instance.refcount.saturating_sub(1);
            if instance.refcount > 0 {
                return;
            }
            processes.remove(&peer).map(|i| i.process)
        };
        if let Some(process) = process {
            tracing::debug!(peer = %peer.short(), "peer process shutting down");
            process.shutdown();
        }
    }

    /// The process for `peer`, created and started on first use.
    /// Does not take a reference; pair with `connected`/`disconnected` for
    /// lifecycle tracking.
    pub fn get_process(&self, peer: PeerId) -> Arc<P> {
        let (process, created) = {
            let mut processes = self.processes.write();
            let instance = self.get_or_create(&mut processes, peer);
            (instance.0.process.clone(), instance.1)
        };
        if created {
            process.startup();
        }
        process
    }

    /// Shut down every mapped process. Used at engine shutdown.
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<P>> = {
            let mut processes = self.processes.write();
            processes.drain().map(|(_, i)| i.process).collect()
        };
        for process in drained {
            process.shutdown();
        }
    }

    fn get_or_create<'a>(
        &self,
        processes: &'a mut HashMap<PeerId, Instance<P>>,
        peer: PeerId,
    ) -> (&'a mut Instance<P>, bool) {
        let mut created = false;
        let instance = processes.entry(peer).or_insert_with(|| {
            created = true;
            Instance {
                refcount: 0,
                process: (self.factory)(peer),
            }
        });
        (instance, created)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProcess {
        startups: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl PeerProcess for CountingProcess {
        fn startup(&self) {
            self.startups.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager() -> PeerManager<CountingProcess> {
        PeerManager::new(|_peer| Arc::new(CountingProcess::default()))
    }

    fn peer(tag: u8) -> PeerId {
        PeerId::new([tag; 32])
    }

    #[test]
    fn get_process_starts_exactly_once() {
        let manager = manager();
        let first = manager.get_process(peer(1));
        let second = manager.get_process(peer(1));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.startups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refcount_delays_shutdown() {
        let manager = manager();
        manager.connected(peer(1));
        manager.connected(peer(1));
        let process = manager.get_process(peer(1));

        manager.disconnected(peer(1));
        assert_eq!(process.shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(manager.connected_peers(), vec![peer(1)]);

        manager.disconnected(peer(1));
        assert_eq!(process.shutdowns.load(Ordering::SeqCst), 1);
        assert!(manager.connected_peers().is_empty());
    }

    #[test]
    fn disconnect_of_unknown_peer_is_a_no_op() {
        let manager = manager();
        manager.disconnected(peer(9));
        assert!(manager.connected_peers().is_empty());
    }

    #[test]
    fn shutdown_all_drains_the_pool() {
        let manager = manager();
        manager.connected(peer(1));
        manager.connected(peer(2));
        let one = manager.get_process(peer(1));
        let two = manager.get_process(peer(2));

        manager.shutdown_all();
        assert_eq!(one.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(two.shutdowns.load(Ordering::SeqCst), 1);
        assert!(manager.connected_peers().is_empty());
    }
}
