//! Shared state handed to every reconcile invocation.

use tokio::sync::Mutex;

use crate::actions::{ActionContext, OperatorAction};

/// Context shared across reconcile passes.
///
/// The action list is behind a mutex because actions keep state between
/// passes (caches, last-seen values) and the runtime may overlap
/// reconcile invocations.
pub struct ControllerContext {
    /// Ordered reconcile actions
    pub actions: Mutex<Vec<Box<dyn OperatorAction>>>,
    /// Collaborators handed to each action
    pub action_ctx: ActionContext,
}

impl ControllerContext {
    /// Build the context around an action list and its collaborators.
    pub fn new(actions: Vec<Box<dyn OperatorAction>>, action_ctx: ActionContext) -> Self {
        Self {
            actions: Mutex::new(actions),
            action_ctx,
        }
    }
}
