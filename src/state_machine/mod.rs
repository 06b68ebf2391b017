pub mod error;
pub mod inbound;
pub mod lifecycle;
pub mod machine;
pub mod outbound;

use std::fmt;

pub use error::{ActivityError, MachineError};
pub use machine::{Delivery, Machine, MachineConfig};

/// The [`StateMachine`] trait describes the graph of a sequential state machine: its states, the
/// signals it consumes, and for every state the ordered list of outgoing [`Transition`]s.
///
/// # Functionality
/// A state machine is defined by a tagged union of state identifiers
/// ([`State`](StateMachine::State)) and a static table per state
/// ([`transitions`](StateMachine::transitions)). Transitions are plain data: a name, a pure
/// `condition` over the incoming signal and the machine data, the target state, an optional
/// exception state, and an `activity` function that performs the side effects once the
/// transition has been selected.
///
/// Selection walks the table of the current state in declaration order and picks the first
/// transition whose condition holds. The implementor therefore controls priority purely through
/// ordering, with catch-all transitions placed last.
///
/// The implementor never drives itself. A [`Machine`] container owns the data, serializes signal
/// delivery, and executes the selected transition:
///
/// 1. [`on_exit`](StateMachine::on_exit) for the state being left
/// 2. the current state is set to the transition's target
/// 3. the transition's `activity`
/// 4. [`on_enter`](StateMachine::on_enter) for whichever state is current afterwards
///
/// Exit and enter hooks run on self-transitions too, flagged as re-entry.
///
/// # Blocking States
/// A state reported as [blocking](StateMachine::is_blocking) turns an unmatched signal into a
/// wait: the delivering thread sleeps until the machine changes state and tries again. This is
/// how backpressure is expressed, e.g. a network thread delivering the next piece of a message
/// while the previous response is still being written.
///
/// A non-blocking state with no matching transition rejects the signal immediately with
/// [`MachineError::Unhandled`].
///
/// # Self-Signaling
/// Activities and enter hooks may emit follow-up signals to their own machine through an
/// [`Outbox`]. These are queued internally and processed before any further external signal,
/// so a machine can never re-enter itself recursively.
///
/// # Invariants
/// Conditions *must* be pure: they may read the signal and the machine data but not mutate
/// anything or perform IO, since they can be evaluated many times while a thread waits in a
/// blocking state.
///
/// Hooks and activities must not call [`Machine::input`] on their own machine expecting a
/// synchronous result; such calls are deferred. Use the [`Outbox`] instead.
pub trait StateMachine: Send + Sized + 'static {
    /// The state identifiers of the machine graph.
    type State: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    /// The input events the machine consumes.
    type Signal: fmt::Debug + Send + 'static;

    /// The outgoing transitions of `state`, in priority order.
    fn transitions(state: Self::State) -> &'static [Transition<Self>];

    /// Whether unmatched signals wait in `state` rather than fail.
    fn is_blocking(_state: Self::State) -> bool {
        false
    }

    /// Called after every transition into `state`, including when the activity failed.
    fn on_enter(
        &mut self,
        _state: Self::State,
        _reentry: bool,
        _outbox: &mut Outbox<Self::Signal>,
    ) {
    }

    /// Called before every transition out of `state`.
    fn on_exit(&mut self, _state: Self::State, _reentry: bool) {}

    /// The signal forcibly processed when a delivery times out while the deferred queue is full.
    fn queue_full_signal(&self, _state: Self::State) -> Option<Self::Signal> {
        None
    }
}

/// Predicate deciding whether a transition accepts a signal.
pub type Condition<M> = fn(&<M as StateMachine>::Signal, &M) -> bool;

/// Side effects of a selected transition.
pub type Activity<M> = fn(
    &mut M,
    <M as StateMachine>::Signal,
    &mut Outbox<<M as StateMachine>::Signal>,
) -> Result<(), ActivityError>;

/// One edge of the machine graph.
pub struct Transition<M: StateMachine> {
    pub name: &'static str,
    pub condition: Condition<M>,
    pub target: M::State,
    /// The state forced when the activity fails.
    pub exception_state: Option<M::State>,
    pub activity: Activity<M>,
}

impl<M: StateMachine> fmt::Debug for Transition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("exception_state", &self.exception_state)
            .finish()
    }
}

/// Activity for transitions that only move the machine.
pub fn no_activity<M: StateMachine>(
    _machine: &mut M,
    _signal: M::Signal,
    _outbox: &mut Outbox<M::Signal>,
) -> Result<(), ActivityError> {
    Ok(())
}

/// Signals a transition emits to its own machine.
#[derive(Debug)]
pub struct Outbox<S> {
    signals: Vec<S>,
}

impl<S> Outbox<S> {
    pub(crate) fn new() -> Self {
        Self {
            signals: Vec::new(),
        }
    }

    /// Queue `signal` for processing right after the current transition.
    pub fn signal(&mut self, signal: S) {
        self.signals.push(signal);
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub(crate) fn into_signals(self) -> Vec<S> {
        self.signals
    }
}

/// First transition of `state` accepting `signal`, in declaration order.
pub(crate) fn select<M: StateMachine>(
    state: M::State,
    signal: &M::Signal,
    machine: &M,
) -> Option<&'static Transition<M>> {
    M::transitions(state)
        .iter()
        .find(|transition| (transition.condition)(signal, machine))
}
