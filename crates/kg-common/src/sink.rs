use crate::{NodeAccessEvent, NodeMutationEvent};
use async_trait::async_trait;

/// Shared seam between every component that produces the two event families
/// named in §4.9 (`node_access`, `node_mutation`) and the dispatcher that
/// fans them out. Kept here rather than in the dispatcher crate itself so
/// producers (the Ingestion Worker, read-path HTTP handlers) don't need to
/// depend on `kg-dispatch` to emit into it.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit_node_access(&self, event: NodeAccessEvent);
    async fn emit_node_mutation(&self, event: NodeMutationEvent);
}

/// No-op sink for tests and standalone tool invocations that don't wire a
/// dispatcher.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit_node_access(&self, _event: NodeAccessEvent) {}
    async fn emit_node_mutation(&self, _event: NodeMutationEvent) {}
}
