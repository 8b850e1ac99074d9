pub mod aggregator;

pub use aggregator::{Aggregator, AggregatorConfig, TickReport};
