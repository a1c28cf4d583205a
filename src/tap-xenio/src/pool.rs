//! Process-scoped transport pools (spec §3 "Transport context", §9
//! "process-wide state"): created lazily per pool name, destroyed when no
//! blkif references it. The only process-wide singleton besides the
//! broker's device list (which lives in `blktapctrld`, not this crate).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::transport::Transport;

pub const DEFAULT_POOL: &str = "td-xenio-default";

/// A transport, refcounted by the number of live blkifs sharing it. Clone
/// to take a reference; the registry drops the entry once the last clone
/// is gone.
#[derive(Clone)]
pub struct PooledTransport(Rc<Transport>);

impl std::ops::Deref for PooledTransport {
    type Target = Transport;
    fn deref(&self) -> &Transport {
        &self.0
    }
}

pub struct TransportRegistry {
    pools: RefCell<HashMap<String, Rc<Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        TransportRegistry {
            pools: RefCell::new(HashMap::new()),
        }
    }

    /// Returns the pool's transport, creating it via `make` if this is the
    /// first reference.
    pub fn acquire(
        &self,
        pool: &str,
        make: impl FnOnce() -> Transport,
    ) -> PooledTransport {
        let mut pools = self.pools.borrow_mut();
        if let Some(existing) = pools.get(pool) {
            return PooledTransport(existing.clone());
        }
        let t = Rc::new(make());
        pools.insert(pool.to_string(), t.clone());
        PooledTransport(t)
    }

    /// Drops pools with no references outside this registry. Called
    /// periodically (or right after a blkif disconnect) since `Rc` alone
    /// can't notify us when the last external clone drops.
    pub fn reap(&self) {
        self.pools
            .borrow_mut()
            .retain(|_, t| Rc::strong_count(t) > 1);
    }

    pub fn pool_count(&self) -> usize {
        self.pools.borrow().len()
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{FakeEventChannel, FakeGrantMapper};

    fn fake_transport() -> Transport {
        Transport {
            grants: Box::new(FakeGrantMapper),
            events: Box::new(FakeEventChannel::new().unwrap()),
        }
    }

    #[test]
    fn shares_one_transport_per_pool_name() {
        let reg = TransportRegistry::new();
        let a = reg.acquire("p1", fake_transport);
        let b = reg.acquire("p1", fake_transport);
        assert!(Rc::ptr_eq(&a.0, &b.0));
        assert_eq!(reg.pool_count(), 1);
    }

    #[test]
    fn reaps_pool_once_unreferenced() {
        let reg = TransportRegistry::new();
        {
            let _a = reg.acquire("p1", fake_transport);
            assert_eq!(reg.pool_count(), 1);
        }
        reg.reap();
        assert_eq!(reg.pool_count(), 0);
    }

    #[test]
    fn default_pool_name_matches_spec() {
        assert_eq!(DEFAULT_POOL, "td-xenio-default");
    }
}
