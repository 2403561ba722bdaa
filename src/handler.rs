//! Handler contract: how a request gets routed to application code. The
//! engine itself ships no routing policy; an embedder supplies a
//! [`HandlerRegistry`] that maps `(handler_id, api_version)` to a [`Handler`].

use async_trait::async_trait;

use crate::context::HandlerContext;
use crate::error::Result;
use crate::protocol::Action;

/// Application-provided request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Fast validation/setup step, run before `handle`. The default does
    /// nothing; handlers that need to reject a request before doing any
    /// real work (e.g. missing header) should override this.
    async fn prepare(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    /// Produce the reply action, if any. Returning `Ok(None)` sends no reply
    /// at all; only fire-and-forget-style handlers should do this.
    async fn handle(&self, ctx: &HandlerContext) -> Result<Option<Action>>;
}

/// Outcome of a registry lookup.
pub enum Lookup {
    Found(std::sync::Arc<dyn Handler>),
    NotFound,
}

/// Maps an inbound request's `(handler_id, api_version)` to a [`Handler`].
/// Looked up once per request, before `prepare`/`handle` run.
pub trait HandlerRegistry: Send + Sync {
    fn lookup(&self, handler_id: u16, api_version: u32) -> Lookup;
}

/// A registry that resolves nothing. This is test/demo scaffolding only;
/// it carries no routing policy and exists so the connection plumbing can be
/// exercised without an embedding application.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

impl HandlerRegistry for NoopRegistry {
    fn lookup(&self, _handler_id: u16, _api_version: u32) -> Lookup {
        Lookup::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_registry_never_resolves() {
        let registry = NoopRegistry;
        assert!(matches!(registry.lookup(1, 1), Lookup::NotFound));
    }
}
