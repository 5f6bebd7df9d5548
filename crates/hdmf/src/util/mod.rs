//! Utility modules.

pub mod datetime;

pub use datetime::{DateTimeParseError, format_isodatetime, parse_isodatetime};
