use std::collections::HashSet;
use log::debug;
use parking_lot::{Mutex, MutexGuard};

use crate::config::RuntimeConfig;
use crate::error::SequencingError;
use crate::message::{Communicator, Rank};
use crate::region::RegionId;
use crate::transfer::Ledger;




/**
 * The per-rank state shared by every level-transfer invocation: the
 * communicator, the message ledger that holds early arrivals and staged
 * pull buffers, and the set of regions claimed by invocations in flight.
 *
 * A runtime may be shared by several threads, each running its own
 * invocation, provided the invocations touch disjoint regions.
 */
pub struct Runtime<C: Communicator> {
    comm: C,
    config: RuntimeConfig,
    ledger: Mutex<Ledger>,
    in_flight: Mutex<HashSet<RegionId>>,
}




// ============================================================================
impl<C: Communicator> Runtime<C> {

    pub fn new(comm: C) -> Self {
        Self::with_config(comm, RuntimeConfig::default())
    }

    pub fn with_config(comm: C, config: RuntimeConfig) -> Self {
        Self {
            comm,
            config,
            ledger: Mutex::new(Ledger::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock()
    }


    /**
     * Claim a set of regions for the duration of an operation. Fails,
     * claiming nothing, if any of them is held by another invocation. The
     * claim is released when the returned guard is dropped.
     */
    pub fn claim<I>(&self, regions: I, operation: &'static str) -> Result<Claim<'_>, SequencingError>
    where
        I: IntoIterator<Item = RegionId>,
    {
        let regions: Vec<_> = regions.into_iter().collect();
        let mut in_flight = self.in_flight.lock();

        if let Some(&region) = regions.iter().find(|r| in_flight.contains(*r)) {
            return Err(SequencingError::InFlight { region, operation });
        }
        in_flight.extend(regions.iter().copied());
        debug!("rank {} claimed {} regions for {}", self.rank(), regions.len(), operation);

        Ok(Claim {
            in_flight: &self.in_flight,
            regions,
        })
    }
}




/**
 * Regions held by an invocation in flight; see `Runtime::claim`.
 */
pub struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<RegionId>>,
    regions: Vec<RegionId>,
}

impl<'a> Claim<'a> {
    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }
}

impl<'a> Drop for Claim<'a> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();

        for region in &self.regions {
            in_flight.remove(region);
        }
    }
}




/**
 * Run a closure on every rank of an in-process group, each on its own
 * thread, and collect the results in rank order.
 */
#[cfg(test)]
pub(crate) fn on_threads<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(Runtime<crate::message::LocalCommunicator>) -> T + Sync,
{
    let f = &f;

    std::thread::scope(|scope| {
        let handles: Vec<_> = crate::message::LocalCommunicator::group(size)
            .into_iter()
            .map(|comm| scope.spawn(move || f(Runtime::new(comm))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Runtime;
    use crate::error::SequencingError;
    use crate::message::LocalCommunicator;
    use crate::region::RegionId;

    fn runtime() -> Runtime<LocalCommunicator> {
        Runtime::new(LocalCommunicator::group(1).remove(0))
    }

    #[test]
    fn overlapping_claims_are_rejected() {
        let runtime = runtime();
        let a = RegionId::new(0, 0);
        let b = RegionId::new(0, 1);
        let c = RegionId::new(1, 0);

        let claim = runtime.claim(vec![a, b], "first").unwrap();
        assert_eq!(claim.regions(), &[a, b]);
        assert_eq!(
            runtime.claim(vec![c, b], "second").err(),
            Some(SequencingError::InFlight { region: b, operation: "second" })
        );
        assert!(runtime.claim(vec![c], "third").is_ok());
    }

    #[test]
    fn claims_are_released_on_drop() {
        let runtime = runtime();
        let a = RegionId::new(2, 4);
        drop(runtime.claim(vec![a], "first").unwrap());
        assert!(runtime.claim(vec![a], "again").is_ok());
    }

    #[test]
    fn failed_claim_holds_nothing() {
        let runtime = runtime();
        let a = RegionId::new(0, 0);
        let b = RegionId::new(0, 1);
        let _held = runtime.claim(vec![a], "first").unwrap();
        assert!(runtime.claim(vec![b, a], "second").is_err());
        assert!(runtime.claim(vec![b], "third").is_ok());
    }
}
