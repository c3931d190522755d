//! Handler registry
//!
//! Maps `(entity kind, stage)` to an ordered list of handler functions. The
//! registry is built once during startup and only read afterwards.

use futures::future::BoxFuture;
use std::collections::HashMap;

use super::engine::Federation;
use super::pipeline::ActivityRun;
use super::types::ApType;
use crate::error::StageError;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolve,
    Validate,
    Store,
    Perform,
    RespondTo,
    Forward,
}

impl Stage {
    pub const ORDER: [Stage; 6] = [
        Stage::Resolve,
        Stage::Validate,
        Stage::Store,
        Stage::Perform,
        Stage::RespondTo,
        Stage::Forward,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Validate => "validate",
            Stage::Store => "store",
            Stage::Perform => "perform",
            Stage::RespondTo => "respond_to",
            Stage::Forward => "forward",
        }
    }
}

/// A stage handler. Returning an error aborts the remaining stages.
pub type HandlerFn =
    for<'a> fn(&'a Federation, &'a mut ActivityRun) -> BoxFuture<'a, Result<(), StageError>>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(ApType, Stage), Vec<HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; handlers for the same key run in registration order.
    pub fn register(&mut self, kind: ApType, stage: Stage, handler: HandlerFn) -> &mut Self {
        self.handlers.entry((kind, stage)).or_default().push(handler);
        self
    }

    pub fn handlers(&self, kind: ApType, stage: Stage) -> &[HandlerFn] {
        self.handlers
            .get(&(kind, stage))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether any stage has a handler for `kind`.
    pub fn supports(&self, kind: ApType) -> bool {
        Stage::ORDER
            .iter()
            .any(|stage| !self.handlers(kind, *stage).is_empty())
    }

    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop<'a>(
        _fed: &'a Federation,
        _run: &'a mut ActivityRun,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async { Ok(()) })
    }

    fn fail<'a>(
        _fed: &'a Federation,
        _run: &'a mut ActivityRun,
    ) -> BoxFuture<'a, Result<(), StageError>> {
        Box::pin(async { Err(StageError::perform("nope")) })
    }

    #[test]
    fn handlers_are_kept_in_registration_order() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(ApType::Like, Stage::Perform, noop)
            .register(ApType::Like, Stage::Perform, fail);

        let handlers = registry.handlers(ApType::Like, Stage::Perform);
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0] as usize, noop as HandlerFn as usize);
        assert_eq!(handlers[1] as usize, fail as HandlerFn as usize);
        assert!(registry.supports(ApType::Like));
        assert!(!registry.supports(ApType::Announce));
        assert!(registry.handlers(ApType::Like, Stage::Forward).is_empty());
    }

    #[test]
    fn stage_order_is_fixed() {
        let labels: Vec<_> = Stage::ORDER.iter().map(Stage::as_str).collect();
        assert_eq!(
            labels,
            ["resolve", "validate", "store", "perform", "respond_to", "forward"]
        );
    }
}
