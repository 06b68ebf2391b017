use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bon::Builder;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use super::{MachineError, Outbox, StateMachine, Transition, select};

/// Kernel settings for one [`Machine`].
#[derive(Debug, Clone, Builder)]
pub struct MachineConfig {
    /// Soft limit of the deferred-signal queue.
    #[builder(default = 50)]
    pub queue_limit: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// How an accepted signal was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The calling thread executed the transition.
    Handled,
    /// Another transition was in flight; the signal was queued for the executing thread.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Queue,
}

struct Queued<S> {
    signal: S,
    queued_at: Instant,
}

impl<S> Queued<S> {
    fn new(signal: S) -> Self {
        Self {
            signal,
            queued_at: Instant::now(),
        }
    }
}

struct InFlight {
    transition: &'static str,
    thread: ThreadId,
}

struct Core<M: StateMachine> {
    state: M::State,
    /// Taken out while a transition executes.
    data: Option<M>,
    in_flight: Option<InFlight>,
    /// Self-signals, processed before anything else.
    internal: VecDeque<Queued<M::Signal>>,
    /// External signals that could not be handled when delivered.
    deferred: VecDeque<Queued<M::Signal>>,
    draining: bool,
    interrupts: u64,
}

/// Thread-safe container executing a [`StateMachine`].
///
/// Delivery is a rendezvous: [`input`](Self::input) runs the selected transition on the calling
/// thread. At most one transition executes at a time; a signal delivered while another thread
/// executes is appended to the deferred queue and drained by that thread afterwards.
pub struct Machine<M: StateMachine> {
    label: String,
    config: MachineConfig,
    core: Mutex<Core<M>>,
    state_changed: Condvar,
}

impl<M: StateMachine> Machine<M> {
    pub fn new(
        label: impl Into<String>,
        initial: M::State,
        data: M,
        config: MachineConfig,
    ) -> Self {
        Self {
            label: label.into(),
            config,
            core: Mutex::new(Core {
                state: initial,
                data: Some(data),
                in_flight: None,
                internal: VecDeque::new(),
                deferred: VecDeque::new(),
                draining: false,
                interrupts: 0,
            }),
            state_changed: Condvar::new(),
        }
    }

    /// Construct a shared machine whose data keeps a weak handle to it, for completion callbacks.
    pub fn new_cyclic(
        label: impl Into<String>,
        initial: M::State,
        config: MachineConfig,
        data_fn: impl FnOnce(Weak<Machine<M>>) -> M,
    ) -> Arc<Self> {
        let label = label.into();
        Arc::new_cyclic(|weak| Self::new(label, initial, data_fn(weak.clone()), config))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> M::State {
        self.core.lock().state
    }

    /// Whether no transition is executing right now.
    pub fn is_idle(&self) -> bool {
        self.core.lock().in_flight.is_none()
    }

    pub fn deferred_len(&self) -> usize {
        self.core.lock().deferred.len()
    }

    /// Read the machine data, if no transition is executing.
    pub fn with_data<R>(&self, view_fn: impl FnOnce(&M) -> R) -> Option<R> {
        self.core.lock().data.as_ref().map(view_fn)
    }

    /// Deliver `signal`, waiting without bound while the current state is blocking.
    pub fn input(&self, signal: M::Signal) -> Result<Delivery, MachineError> {
        self.deliver(signal, None)
    }

    /// Deliver `signal`, waiting at most `max_wait` while the current state is blocking.
    pub fn input_timeout(
        &self,
        signal: M::Signal,
        max_wait: Duration,
    ) -> Result<Delivery, MachineError> {
        self.deliver(signal, Some(max_wait))
    }

    pub fn input_with(
        &self,
        signal: M::Signal,
        max_wait: Option<Duration>,
    ) -> Result<Delivery, MachineError> {
        self.deliver(signal, max_wait)
    }

    /// Wake every thread waiting in a blocking state with [`MachineError::Interrupted`].
    pub fn interrupt(&self) {
        let mut core = self.core.lock();
        core.interrupts += 1;
        self.state_changed.notify_all();
    }

    fn deliver(
        &self,
        signal: M::Signal,
        max_wait: Option<Duration>,
    ) -> Result<Delivery, MachineError> {
        let mut executed = false;
        let outcome = self.handle(Queued::new(signal), max_wait, Origin::Caller, &mut executed);

        // A deferred signal is drained by whoever holds the machine; a timed out one waits for
        // the next delivery. Self-signals run while waiting count as holding the machine.
        let deferred = matches!(
            outcome,
            Ok(Delivery::Deferred) | Err(MachineError::WaitTimeout { .. })
        );
        if !deferred || executed {
            self.drain(max_wait);
        }

        outcome
    }

    fn handle(
        &self,
        queued: Queued<M::Signal>,
        max_wait: Option<Duration>,
        origin: Origin,
        executed: &mut bool,
    ) -> Result<Delivery, MachineError> {
        let deadline = max_wait.map(|wait| Instant::now() + wait);
        let mut core = self.core.lock();

        if origin == Origin::Caller {
            if let Some(in_flight) = &core.in_flight {
                let reentrant = in_flight.thread == thread::current().id();
                debug!(
                    machine = %self.label,
                    in_flight = in_flight.transition,
                    reentrant,
                    signal = ?queued.signal,
                    "Deferring signal"
                );
                if reentrant {
                    core.internal.push_back(queued);
                } else {
                    core.deferred.push_back(queued);
                }
                return Ok(Delivery::Deferred);
            }
        }

        let interrupts = core.interrupts;
        loop {
            if core.interrupts != interrupts {
                let state = format!("{:?}", core.state);
                if origin == Origin::Queue {
                    core.deferred.push_front(queued);
                }
                return Err(MachineError::Interrupted { state });
            }

            if core.in_flight.is_none() {
                if self.run_internal(&mut core) {
                    *executed = true;
                    continue;
                }

                let Some(data) = core.data.take() else {
                    return Err(MachineError::Poisoned);
                };
                if let Some(transition) = select(core.state, &queued.signal, &data) {
                    *executed = true;
                    self.execute(&mut core, transition, data, queued.signal)?;
                    return Ok(Delivery::Handled);
                }
                core.data = Some(data);

                if !M::is_blocking(core.state) {
                    return Err(MachineError::Unhandled {
                        state: format!("{:?}", core.state),
                        signal: format!("{:?}", queued.signal),
                    });
                }
            }

            match deadline {
                None => self.state_changed.wait(&mut core),
                Some(deadline) => {
                    if self
                        .state_changed
                        .wait_until(&mut core, deadline)
                        .timed_out()
                    {
                        let waited = max_wait.unwrap_or_default();
                        return self.wait_timed_out(&mut core, queued, waited, origin);
                    }
                }
            }
        }
    }

    /// Run the oldest self-signal if the current state admits it. Returns whether one was consumed.
    fn run_internal(&self, core: &mut MutexGuard<'_, Core<M>>) -> bool {
        if core.internal.is_empty() {
            return false;
        }
        let Some(data) = core.data.take() else {
            return false;
        };

        let state = core.state;
        let transition = core
            .internal
            .front()
            .and_then(|queued| select(state, &queued.signal, &data));
        let blocking = M::is_blocking(state);
        if transition.is_none() && blocking {
            core.data = Some(data);
            return false;
        }

        let Some(queued) = core.internal.pop_front() else {
            core.data = Some(data);
            return false;
        };
        match transition {
            Some(transition) => {
                if let Err(err) = self.execute(core, transition, data, queued.signal) {
                    warn!(machine = %self.label, error = %err, "Self-signal transition failed");
                }
            }
            None => {
                core.data = Some(data);
                warn!(
                    machine = %self.label,
                    state = ?state,
                    signal = ?queued.signal,
                    "Dropping self-signal with no transition"
                );
            }
        }
        true
    }

    fn execute(
        &self,
        core: &mut MutexGuard<'_, Core<M>>,
        transition: &'static Transition<M>,
        mut data: M,
        signal: M::Signal,
    ) -> Result<(), MachineError> {
        let from = core.state;
        core.in_flight = Some(InFlight {
            transition: transition.name,
            thread: thread::current().id(),
        });

        trace!(
            machine = %self.label,
            transition = transition.name,
            from = ?from,
            to = ?transition.target,
            signal = ?signal,
            "Executing transition"
        );

        let (result, current, data, outbox) = MutexGuard::unlocked(core, || {
            let guard = PanicGuard {
                core: &self.core,
                state_changed: &self.state_changed,
                armed: true,
            };
            let mut outbox = Outbox::new();

            data.on_exit(from, from == transition.target);
            self.core.lock().state = transition.target;

            let result = (transition.activity)(&mut data, signal, &mut outbox);
            let current = match (&result, transition.exception_state) {
                (Err(_), Some(exception_state)) => {
                    self.core.lock().state = exception_state;
                    exception_state
                }
                _ => transition.target,
            };

            data.on_enter(current, current == from, &mut outbox);
            guard.disarm();
            (result, current, data, outbox)
        });

        core.state = current;
        core.data = Some(data);
        core.in_flight = None;
        core.internal
            .extend(outbox.into_signals().into_iter().map(Queued::new));
        self.state_changed.notify_all();

        result.map_err(|source| {
            warn!(
                machine = %self.label,
                transition = transition.name,
                state = ?current,
                error = %source,
                "Transition activity failed"
            );
            MachineError::Activity {
                transition: transition.name,
                source,
            }
        })
    }

    fn wait_timed_out(
        &self,
        core: &mut MutexGuard<'_, Core<M>>,
        queued: Queued<M::Signal>,
        waited: Duration,
        origin: Origin,
    ) -> Result<Delivery, MachineError> {
        let state = core.state;
        let timeout = |signal: &M::Signal| MachineError::WaitTimeout {
            state: format!("{state:?}"),
            signal: format!("{signal:?}"),
            waited,
        };

        if origin == Origin::Queue {
            let err = timeout(&queued.signal);
            core.deferred.push_front(queued);
            return Err(err);
        }

        // Soft limit: only enforced while the machine data is at hand to pick a fallback.
        if core.deferred.len() < self.config.queue_limit || core.data.is_none() {
            debug!(
                machine = %self.label,
                state = ?state,
                signal = ?queued.signal,
                queued = core.deferred.len() + 1,
                "Wait timed out, deferring signal"
            );
            let err = timeout(&queued.signal);
            core.deferred.push_back(queued);
            return Err(err);
        }

        warn!(
            machine = %self.label,
            state = ?state,
            signal = ?queued.signal,
            limit = self.config.queue_limit,
            "Signal queue limit reached"
        );

        let mut fallback_name = None;
        let fallback = core
            .data
            .as_ref()
            .and_then(|data| data.queue_full_signal(state));
        if let Some(fallback) = fallback
            && let Some(data) = core.data.take()
        {
            match select(state, &fallback, &data) {
                Some(transition) => {
                    fallback_name = Some(transition.name);
                    if let Err(err) = self.execute(core, transition, data, fallback) {
                        warn!(machine = %self.label, error = %err, "Queue-full fallback failed");
                    }
                }
                None => {
                    core.data = Some(data);
                    warn!(
                        machine = %self.label,
                        state = ?state,
                        signal = ?fallback,
                        "No transition for queue-full fallback"
                    );
                }
            }
        }

        Err(MachineError::QueueLimitReached {
            limit: self.config.queue_limit,
            state: format!("{state:?}"),
            signal: format!("{:?}", queued.signal),
            fallback: fallback_name,
        })
    }

    /// Handle deferred signals in FIFO order until the queue is empty, a signal times out, or a
    /// signal has no transition.
    fn drain(&self, max_wait: Option<Duration>) {
        {
            let mut core = self.core.lock();
            if core.draining {
                return;
            }
            core.draining = true;
        }

        loop {
            let queued = {
                let mut core = self.core.lock();
                while core.in_flight.is_none() && self.run_internal(&mut core) {}

                // The executing thread drains once it is done.
                if core.in_flight.is_some() {
                    core.draining = false;
                    return;
                }
                match core.deferred.pop_front() {
                    Some(queued) => queued,
                    None => {
                        core.draining = false;
                        return;
                    }
                }
            };

            trace!(
                machine = %self.label,
                age = ?queued.queued_at.elapsed(),
                signal = ?queued.signal,
                "Draining deferred signal"
            );

            let mut executed = false;
            match self.handle(queued, max_wait, Origin::Queue, &mut executed) {
                Ok(_) => {}
                Err(err @ MachineError::WaitTimeout { .. }) => {
                    debug!(machine = %self.label, error = %err, "Deferred signal still blocked");
                    break;
                }
                Err(err @ MachineError::Unhandled { .. }) => {
                    warn!(
                        machine = %self.label,
                        error = %err,
                        "Dropping deferred signal, draining stopped"
                    );
                    break;
                }
                Err(err @ MachineError::Interrupted { .. }) => {
                    debug!(machine = %self.label, error = %err, "Draining interrupted");
                    break;
                }
                Err(MachineError::Poisoned) => break,
                Err(err) => {
                    warn!(machine = %self.label, error = %err, "Deferred signal failed");
                }
            }
        }

        self.core.lock().draining = false;
    }
}

impl<M: StateMachine> Machine<M>
where
    M::Signal: Clone,
{
    /// Snapshot of the deferred queue, oldest first.
    pub fn deferred_signals(&self) -> Vec<M::Signal> {
        self.core
            .lock()
            .deferred
            .iter()
            .map(|queued| queued.signal.clone())
            .collect()
    }
}

impl<M: StateMachine> fmt::Debug for Machine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("Machine")
            .field("label", &self.label)
            .field("state", &core.state)
            .field("in_flight", &core.in_flight.as_ref().map(|f| f.transition))
            .field("deferred", &core.deferred.len())
            .finish()
    }
}

/// Releases the in-flight marker if a transition unwinds, leaving the machine poisoned.
struct PanicGuard<'a, M: StateMachine> {
    core: &'a Mutex<Core<M>>,
    state_changed: &'a Condvar,
    armed: bool,
}

impl<M: StateMachine> PanicGuard<'_, M> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: StateMachine> Drop for PanicGuard<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            let mut core = self.core.lock();
            core.in_flight = None;
            self.state_changed.notify_all();
        }
    }
}
