//! Middleware pipeline for intercepting requests and updates.
//!
//! Interceptors run in registration order, sequentially, before a request
//! reaches the controller. The first failure stops the chain. Each dispatch
//! constructs fresh interceptor instances from the registered factories, so
//! interceptors are stateless across calls unless they create per-call
//! state themselves.

use vmhub_protocol::{HubContext, HubError};

/// A pipeline stage given a chance to inspect or reject an inbound request
/// before it reaches a controller.
///
/// Returning [`HubError::Unauthorized`] rejects the request; any other
/// error is a pipeline fault. Either way the client receives a serialized
/// error push and the chain stops.
pub trait Middleware: Send + Sync {
    fn invoke(
        &self,
        context: &HubContext,
    ) -> impl std::future::Future<Output = Result<(), HubError>> + Send;
}

/// Object-safe wrapper for the Middleware trait.
trait MiddlewareDyn: Send + Sync {
    fn invoke_dyn<'a>(
        &'a self,
        context: &'a HubContext,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>;
}

impl<T: Middleware> MiddlewareDyn for T {
    fn invoke_dyn<'a>(
        &'a self,
        context: &'a HubContext,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), HubError>> + Send + 'a>>
    {
        Box::pin(self.invoke(context))
    }
}

type MiddlewareFactory = Box<dyn Fn() -> Box<dyn MiddlewareDyn> + Send + Sync>;

/// An ordered list of interceptor factories.
pub struct MiddlewarePipeline {
    factories: Vec<MiddlewareFactory>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Register an interceptor factory. Registration order is execution
    /// order.
    pub fn add<M, F>(&mut self, factory: F)
    where
        M: Middleware + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let factory: MiddlewareFactory = Box::new(move || Box::new(factory()));
        self.factories.push(factory);
    }

    /// Instantiate and run every interceptor against `context`, in order.
    /// Returns the first failure, leaving the remaining interceptors
    /// unexecuted.
    pub async fn run(&self, context: &HubContext) -> Result<(), HubError> {
        for factory in &self.factories {
            let interceptor = factory();
            interceptor.invoke_dyn(context).await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self::new()
    }
}
