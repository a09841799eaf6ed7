pub mod chain_events;

pub use chain_events::{ChainEvent, ChainEventBroadcaster, ChainEventKind};
