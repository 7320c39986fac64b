//! Application Services
//!
//! Services that orchestrate domain logic over the ports.
//!
//! - `fanout`: multiplexes client subscriptions onto the bus
//! - `alerts`: price-alert evaluation as an external bus consumer

pub mod alerts;
pub mod fanout;
