//! Event, block, and reorg handler traits + registry.
//!
//! Handlers are the downstream sinks: the dispatcher's obligation ends once a
//! decoded event has been routed to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IndexerError;
use crate::reorg::ReorgEvent;
use crate::types::{BlockLogs, DecodedEvent, IndexContext};

/// Trait for user-provided event handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for each decoded event the handler subscribes to.
    async fn handle(&self, event: &DecodedEvent, ctx: &IndexContext) -> Result<(), IndexerError>;

    /// The event name this handler processes (e.g. `"LendingPoolCreated"`),
    /// or `None` to receive every event.
    fn event_name(&self) -> Option<&str>;
}

/// Trait for handlers called once per dispatched block.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    async fn handle_block(&self, block: &BlockLogs, ctx: &IndexContext) -> Result<(), IndexerError>;
}

/// Trait for reorg handlers.
///
/// Called after the pipeline has rolled back; implementations discard
/// anything they derived from blocks above `reorg.safe_ancestor`.
#[async_trait]
pub trait ReorgHandler: Send + Sync {
    async fn on_reorg(&self, reorg: &ReorgEvent, ctx: &IndexContext) -> Result<(), IndexerError>;
}

/// Registry of event + block + reorg handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    by_event: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    catch_all: Vec<Arc<dyn EventHandler>>,
    block_handlers: Vec<Arc<dyn BlockHandler>>,
    reorg_handlers: Vec<Arc<dyn ReorgHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event handler.
    pub fn on_event(&mut self, handler: Arc<dyn EventHandler>) {
        match handler.event_name() {
            Some(name) => self
                .by_event
                .entry(name.to_string())
                .or_default()
                .push(handler),
            None => self.catch_all.push(handler),
        }
    }

    /// Register a block handler (called for every dispatched block).
    pub fn on_block(&mut self, handler: Arc<dyn BlockHandler>) {
        self.block_handlers.push(handler);
    }

    /// Register a reorg handler.
    pub fn on_reorg(&mut self, handler: Arc<dyn ReorgHandler>) {
        self.reorg_handlers.push(handler);
    }

    /// Number of registered event handlers.
    pub fn event_handler_count(&self) -> usize {
        self.catch_all.len() + self.by_event.values().map(Vec::len).sum::<usize>()
    }

    /// Dispatch an event to all matching handlers.
    pub async fn dispatch_event(
        &self,
        event: &DecodedEvent,
        ctx: &IndexContext,
    ) -> Result<(), IndexerError> {
        if let Some(handlers) = self.by_event.get(&event.event_name) {
            for handler in handlers {
                handler.handle(event, ctx).await?;
            }
        }
        for handler in &self.catch_all {
            handler.handle(event, ctx).await?;
        }
        Ok(())
    }

    /// Dispatch a block to all block handlers.
    pub async fn dispatch_block(
        &self,
        block: &BlockLogs,
        ctx: &IndexContext,
    ) -> Result<(), IndexerError> {
        for handler in &self.block_handlers {
            handler.handle_block(block, ctx).await?;
        }
        Ok(())
    }

    /// Dispatch a reorg to all reorg handlers.
    pub async fn dispatch_reorg(
        &self,
        reorg: &ReorgEvent,
        ctx: &IndexContext,
    ) -> Result<(), IndexerError> {
        for handler in &self.reorg_handlers {
            handler.on_reorg(reorg, ctx).await?;
        }
        Ok(())
    }
}
