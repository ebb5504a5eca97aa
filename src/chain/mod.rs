// Ledger access: event ABI, client seam and JSON-RPC transport
pub mod client;
pub mod events;
pub mod rpc;

#[cfg(test)]
pub mod testing;

pub use client::{LedgerClient, LogFilter, RawLog};
pub use events::{ChainEvent, EventKind};
pub use rpc::JsonRpcLedgerClient;
