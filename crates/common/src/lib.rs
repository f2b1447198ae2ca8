pub mod edge_events;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
