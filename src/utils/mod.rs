pub mod ibc;
pub mod time;
