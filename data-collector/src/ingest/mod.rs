//! Ingestion pipeline
//!
//! Raw frames from the stream clients flow through the normalizer and the
//! depth chain gate into per-table batch buffers, which the writer flushes
//! into the store with idempotent bulk upserts.

mod buffer;
mod pipeline;
mod writer;

pub use buffer::TableBuffer;
pub use pipeline::{ChannelCounterSnapshot, ChannelCounters, ShardPipeline};
pub use writer::{BatchWriter, WriterHandles};
