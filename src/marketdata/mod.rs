pub mod candles;
pub mod store;
pub mod types;

pub use candles::Candle;
pub use store::PriceStore;
pub use types::{Pair, PairEntry, PricePoint, Ticker};
