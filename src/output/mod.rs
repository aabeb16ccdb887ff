//! Terminal output and diagnostic logging.

pub mod formatter;
pub mod logger;
