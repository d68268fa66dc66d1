//! Single-flight scheduling of shared computations.
//!
//! Concurrent requests for the same key share one computation. Every request
//! gets its own [`FlightHandle`]; the computation is cancelled only when the
//! last handle for its key is dropped before it finished.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a waiter did not get a value.
#[derive(Debug)]
pub enum FlightError<E> {
    /// The shared computation failed.
    Failed(Arc<E>),
    /// All waiters went away and the computation was cancelled.
    Cancelled,
}

type Outcome<V, E> = Option<Result<V, Arc<E>>>;

struct Flight<V, E> {
    id: u64,
    waiters: usize,
    cancel: CancellationToken,
    outcome: watch::Receiver<Outcome<V, E>>,
}

struct Flights<K, V, E> {
    next_id: u64,
    active: HashMap<K, Flight<V, E>>,
}

type SharedFlights<K, V, E> = Arc<Mutex<Flights<K, V, E>>>;

fn lock<K, V, E>(flights: &SharedFlights<K, V, E>) -> MutexGuard<'_, Flights<K, V, E>> {
    flights.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Map of in-flight computations keyed by `K`.
pub struct SingleFlight<K, V, E> {
    flights: SharedFlights<K, V, E>,
}

impl<K, V, E> Clone for SingleFlight<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(Flights {
                next_id: 0,
                active: HashMap::new(),
            })),
        }
    }
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the computation for `key`, starting it with `load` if none is
    /// running. `load` is only called when a new computation starts.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F, Fut>(&self, key: K, load: F) -> FlightHandle<K, V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (id, cancel, outcome, tx) = {
            let mut flights = lock(&self.flights);
            if let Some(flight) = flights.active.get_mut(&key) {
                flight.waiters += 1;
                return FlightHandle {
                    key,
                    id: flight.id,
                    outcome: flight.outcome.clone(),
                    flights: Arc::clone(&self.flights),
                };
            }

            let id = flights.next_id;
            flights.next_id += 1;
            let (tx, rx) = watch::channel(None);
            let cancel = CancellationToken::new();
            flights.active.insert(
                key.clone(),
                Flight {
                    id,
                    waiters: 1,
                    cancel: cancel.clone(),
                    outcome: rx.clone(),
                },
            );
            (id, cancel, rx, tx)
        };

        let computation = load();
        let flights = Arc::clone(&self.flights);
        let evict_key = key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Shared computation {} cancelled", id);
                }
                result = computation => {
                    let failed = result.is_err();
                    let _ = tx.send(Some(result.map_err(Arc::new)));
                    if failed {
                        evict(&flights, &evict_key, id);
                    }
                }
            }
        });

        FlightHandle {
            key,
            id,
            outcome,
            flights: Arc::clone(&self.flights),
        }
    }

    /// Number of keys with a computation that still has waiters.
    pub fn in_flight(&self) -> usize {
        lock(&self.flights).active.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.flights).active.contains_key(key)
    }
}

fn evict<K: Eq + Hash, V, E>(flights: &SharedFlights<K, V, E>, key: &K, id: u64) {
    let mut flights = lock(flights);
    if flights.active.get(key).is_some_and(|f| f.id == id) {
        flights.active.remove(key);
    }
}

/// One waiter's interest in a shared computation.
///
/// Dropping the handle withdraws the interest.
pub struct FlightHandle<K: Eq + Hash, V, E> {
    key: K,
    id: u64,
    outcome: watch::Receiver<Outcome<V, E>>,
    flights: SharedFlights<K, V, E>,
}

impl<K: Eq + Hash, V: Clone, E> FlightHandle<K, V, E> {
    /// Waits for the shared result.
    pub async fn wait(mut self) -> Result<V, FlightError<E>> {
        let outcome = match self.outcome.wait_for(Option::is_some).await {
            Ok(outcome) => match outcome.as_ref() {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(e)) => Err(FlightError::Failed(Arc::clone(e))),
                None => Err(FlightError::Cancelled),
            },
            Err(_) => Err(FlightError::Cancelled),
        };
        outcome
    }

    /// Waits for the shared result and transforms it for this waiter only.
    pub async fn dispatch<D>(self, transform: impl FnOnce(V) -> D) -> Result<D, FlightError<E>> {
        self.wait().await.map(transform)
    }

    pub fn cancel(self) {}
}

impl<K: Eq + Hash, V, E> Drop for FlightHandle<K, V, E> {
    fn drop(&mut self) {
        let mut flights = lock(&self.flights);
        let Some(flight) = flights.active.get_mut(&self.key) else {
            return;
        };
        if flight.id != self.id {
            return;
        }

        flight.waiters -= 1;
        if flight.waiters > 0 {
            return;
        }

        if let Some(flight) = flights.active.remove(&self.key) {
            if flight.outcome.borrow().is_none() {
                debug!("Last waiter gone, cancelling shared computation {}", flight.id);
                flight.cancel.cancel();
            }
        }
    }
}
