//! Immutable state machine definitions.
//!
//! A definition maps each state to the transitions leaving it, keyed by
//! trigger event type. Transitions optionally carry an action, a target
//! state, and a finalize flag that completes the saga after the
//! transition runs.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use qv_common::{Event, Message};

use crate::compensation::CompensationStack;
use crate::Saga;

/// Mutable view handed to a transition action: the saga instance, the
/// triggering event, and the instance's compensation stack.
pub struct StateContext<'a, S> {
    pub saga: &'a mut Saga<S>,
    pub event: &'a dyn Message,
    pub compensation: &'a mut CompensationStack,
}

/// Work performed by a transition. Actions mutate saga data, register
/// compensations, or run them.
#[async_trait]
pub trait TransitionAction<S: Send>: Send + Sync {
    async fn run(&self, ctx: &mut StateContext<'_, S>) -> qv_common::Result<()>;
}

/// Adapter for synchronous actions.
struct SyncAction<F>(F);

#[async_trait]
impl<S, F> TransitionAction<S> for SyncAction<F>
where
    S: Send,
    F: Fn(&mut StateContext<'_, S>) -> qv_common::Result<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut StateContext<'_, S>) -> qv_common::Result<()> {
        (self.0)(ctx)
    }
}

pub struct Transition<S> {
    pub(crate) trigger: TypeId,
    pub(crate) trigger_name: &'static str,
    pub(crate) action: Option<Arc<dyn TransitionAction<S>>>,
    pub(crate) to_state: Option<String>,
    pub(crate) finalize: bool,
}

impl<S> Clone for Transition<S> {
    fn clone(&self) -> Self {
        Self {
            trigger: self.trigger,
            trigger_name: self.trigger_name,
            action: self.action.clone(),
            to_state: self.to_state.clone(),
            finalize: self.finalize,
        }
    }
}

impl<S: Send> Transition<S> {
    /// Transition triggered by `E`, staying in the current state unless
    /// [`to`](Self::to) is set.
    pub fn on<E: Event>() -> Self {
        Self {
            trigger: TypeId::of::<E>(),
            trigger_name: std::any::type_name::<E>(),
            action: None,
            to_state: None,
            finalize: false,
        }
    }

    pub fn to(mut self, state: impl Into<String>) -> Self {
        self.to_state = Some(state.into());
        self
    }

    pub fn with_action(mut self, action: impl TransitionAction<S> + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    /// Convenience for actions that never await.
    pub fn with_sync_action<F>(self, action: F) -> Self
    where
        F: Fn(&mut StateContext<'_, S>) -> qv_common::Result<()> + Send + Sync + 'static,
    {
        self.with_action(SyncAction(action))
    }

    /// Mark the saga completed after this transition runs.
    pub fn finalize(mut self) -> Self {
        self.finalize = true;
        self
    }
}

pub struct StateMachineDefinition<S> {
    initial_state: String,
    transitions: HashMap<String, Vec<Transition<S>>>,
}

impl<S> StateMachineDefinition<S> {
    pub fn builder(initial_state: impl Into<String>) -> StateMachineDefinitionBuilder<S> {
        StateMachineDefinitionBuilder {
            initial_state: initial_state.into(),
            transitions: HashMap::new(),
        }
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    pub fn transitions_for(&self, state: &str) -> Option<&[Transition<S>]> {
        self.transitions.get(state).map(Vec::as_slice)
    }

    /// Transition out of `state` triggered by the event's concrete type.
    pub fn select(&self, state: &str, event_type: TypeId) -> Option<&Transition<S>> {
        self.transitions
            .get(state)?
            .iter()
            .find(|transition| transition.trigger == event_type)
    }
}

pub struct StateMachineDefinitionBuilder<S> {
    initial_state: String,
    transitions: HashMap<String, Vec<Transition<S>>>,
}

impl<S> StateMachineDefinitionBuilder<S> {
    /// Register a transition leaving `from_state`.
    pub fn transition(mut self, from_state: impl Into<String>, transition: Transition<S>) -> Self {
        self.transitions
            .entry(from_state.into())
            .or_default()
            .push(transition);
        self
    }

    pub fn build(self) -> Arc<StateMachineDefinition<S>> {
        Arc::new(StateMachineDefinition {
            initial_state: self.initial_state,
            transitions: self.transitions,
        })
    }
}
