//! Type-keyed handler registry.
//!
//! Handlers are registered once at startup through the builder; the
//! registry is immutable afterwards. Resolution is type-exact: no
//! inheritance walk, no fallback. Erased invokers give every handler the
//! uniform signature `(message, context) -> ProcessingResult`.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use qv_common::{Command, Event, Message, ProcessingContext, ProcessingResult, Query, QuiverError};

/// Uniform handler invocation signature after type erasure.
pub type Invoker = Arc<
    dyn Fn(Arc<dyn Message>, ProcessingContext) -> BoxFuture<'static, ProcessingResult>
        + Send
        + Sync,
>;

#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync {
    async fn handle(&self, command: &C, ctx: &ProcessingContext)
        -> qv_common::Result<C::Response>;
}

#[async_trait]
pub trait QueryHandler<Q: Query>: Send + Sync {
    async fn handle(&self, query: &Q, ctx: &ProcessingContext) -> qv_common::Result<Q::Response>;
}

#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(&self, event: &E, ctx: &ProcessingContext) -> qv_common::Result<()>;
}

/// One event subscription: the erased invoker plus the handler's type name
/// for diagnostics and error-handler metadata.
#[derive(Clone)]
pub struct EventSubscription {
    pub handler_name: &'static str,
    pub invoker: Invoker,
}

pub struct HandlerRegistry {
    commands: HashMap<TypeId, Invoker>,
    queries: HashMap<TypeId, Invoker>,
    events: HashMap<TypeId, Vec<EventSubscription>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new()
    }

    /// At-most-one handler; `None` means `NoHandlerRegistered` upstream.
    pub fn resolve_command(&self, type_id: TypeId) -> Option<Invoker> {
        self.commands.get(&type_id).cloned()
    }

    pub fn resolve_query(&self, type_id: TypeId) -> Option<Invoker> {
        self.queries.get(&type_id).cloned()
    }

    /// Zero-or-more subscribers, in registration order.
    pub fn resolve_events(&self, type_id: TypeId) -> &[EventSubscription] {
        self.events
            .get(&type_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn subscribed_event_types(&self) -> impl Iterator<Item = (TypeId, &[EventSubscription])> {
        self.events.iter().map(|(id, subs)| (*id, subs.as_slice()))
    }

    /// Routing predicates for callers re-injecting erased messages.
    pub fn has_command(&self, type_id: TypeId) -> bool {
        self.commands.contains_key(&type_id)
    }

    pub fn has_query(&self, type_id: TypeId) -> bool {
        self.queries.contains_key(&type_id)
    }

    pub fn has_event(&self, type_id: TypeId) -> bool {
        self.events.contains_key(&type_id)
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    commands: HashMap<TypeId, Invoker>,
    queries: HashMap<TypeId, Invoker>,
    events: HashMap<TypeId, Vec<EventSubscription>>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the command handler for `C`. Replaces any previous
    /// registration for the same type.
    pub fn command<C, H>(mut self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |message, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let Some(command) = message.as_any().downcast_ref::<C>() else {
                    return ProcessingResult::failed(QuiverError::handler(format!(
                        "registry routed a non-{} message",
                        std::any::type_name::<C>()
                    )));
                };
                match handler.handle(command, &ctx).await {
                    Ok(response) => ProcessingResult::with_response(Box::new(response)),
                    Err(error) => ProcessingResult::failed(error),
                }
            })
        });
        self.commands.insert(TypeId::of::<C>(), invoker);
        self
    }

    pub fn query<Q, H>(mut self, handler: H) -> Self
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |message, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let Some(query) = message.as_any().downcast_ref::<Q>() else {
                    return ProcessingResult::failed(QuiverError::handler(format!(
                        "registry routed a non-{} message",
                        std::any::type_name::<Q>()
                    )));
                };
                match handler.handle(query, &ctx).await {
                    Ok(response) => ProcessingResult::with_response(Box::new(response)),
                    Err(error) => ProcessingResult::failed(error),
                }
            })
        });
        self.queries.insert(TypeId::of::<Q>(), invoker);
        self
    }

    /// Subscribe a handler to `E`. Multiple subscriptions per event type
    /// are delivered fan-out.
    pub fn event<E, H>(mut self, handler: H) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        let handler = Arc::new(handler);
        let invoker: Invoker = Arc::new(move |message, ctx| {
            let handler = handler.clone();
            Box::pin(async move {
                let Some(event) = message.as_any().downcast_ref::<E>() else {
                    return ProcessingResult::failed(QuiverError::handler(format!(
                        "registry routed a non-{} message",
                        std::any::type_name::<E>()
                    )));
                };
                match handler.handle(event, &ctx).await {
                    Ok(()) => ProcessingResult::successful(),
                    Err(error) => ProcessingResult::failed(error),
                }
            })
        });
        self.events
            .entry(TypeId::of::<E>())
            .or_default()
            .push(EventSubscription {
                handler_name: std::any::type_name::<H>(),
                invoker,
            });
        self
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            commands: self.commands,
            queries: self.queries,
            events: self.events,
        })
    }
}
