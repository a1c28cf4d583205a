//! Component D: groups blkifs that share one transport's event-channel
//! fd. Spec §4.2: "The I/O context is the single event-channel-fd owner.
//! On fd readable it polls `pending` to obtain the next ready port,
//! resolves it to a blkif by linear scan (ports are few), unmasks the
//! port, and invokes that blkif's ring drain."

use tap_types::EvtchnPort;

use crate::blkif::{Blkif, VbdSink};
use crate::pool::PooledTransport;

/// One `(port, blkif)` binding. A linear scan is the right data
/// structure here: a tap worker serves a handful of blkifs per process,
/// not thousands, so there is nothing to gain from a hash map.
pub struct IoContext {
    transport: PooledTransport,
    bound: Vec<(EvtchnPort, Blkif)>,
}

impl IoContext {
    pub fn new(transport: PooledTransport) -> Self {
        IoContext {
            transport,
            bound: Vec::new(),
        }
    }

    pub fn add(&mut self, blkif: Blkif) {
        self.bound.push((blkif.local_port(), blkif));
    }

    pub fn remove(&mut self, port: EvtchnPort) {
        self.bound.retain(|(p, _)| *p != port);
    }

    pub fn fd(&self) -> std::os::fd::RawFd {
        self.transport.events.fd()
    }

    fn resolve(&self, port: EvtchnPort) -> Option<&Blkif> {
        self.bound.iter().find(|(p, _)| *p == port).map(|(_, b)| b)
    }

    /// Drains every ready port once; called from the scheduler's
    /// read-fd callback on this context's fd. Keeps polling `pending`
    /// until the driver reports none left, matching a level-triggered
    /// fd that must be fully drained each wake-up.
    pub fn dispatch_ready(&self, sink: &mut dyn VbdSink) {
        loop {
            let port = match self.transport.events.pending() {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "event channel pending() failed");
                    break;
                }
            };
            let _ = self.transport.events.unmask(port);
            match self.resolve(port) {
                Some(blkif) => blkif.queue_requests(sink),
                None => {
                    tracing::warn!(?port, "event on unbound port, dropping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TransportRegistry;
    use crate::transport::fake::{FakeEventChannel, FakeGrantMapper};
    use crate::transport::Transport;
    use std::rc::Rc;
    use tap_ring::Abi;
    use tap_types::{DevId, DomId, GrantRef};
    use tap_vbd::{NullImage, Vbd};

    fn transport() -> (PooledTransport, Rc<FakeEventChannel>) {
        let fake_events = Rc::new(FakeEventChannel::new().unwrap());
        let events_for_transport = fake_events.clone();
        let reg = Box::leak(Box::new(TransportRegistry::new()));
        let t = reg.acquire("test", || Transport {
            grants: Box::new(FakeGrantMapper),
            events: Box::new(events_for_transport),
        });
        (t, fake_events)
    }

    #[test]
    fn dispatch_routes_event_to_matching_blkif() {
        let (transport, fake_events) = transport();
        let blkif = Blkif::connect(
            transport.clone(),
            DomId::new(3),
            DevId::new(51712),
            &[GrantRef::new(100)],
            tap_types::EvtchnPort::new(7),
            Abi::X86_64,
            0,
        )
        .unwrap();
        let port = blkif.local_port();

        let mut ctx = IoContext::new(transport);
        ctx.add(blkif.clone());

        fake_events.deliver(port);

        let mut vbd = Vbd::new("u1", [0u8; 16], Box::new(NullImage));
        ctx.dispatch_ready(&mut vbd);
        // no ring traffic was staged, but dispatch must not panic and
        // must consume the pending port.
        assert_eq!(blkif.stats().notifies, 0);
    }
}
