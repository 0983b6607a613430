pub mod duration;

#[cfg(feature = "elapsed")]
pub mod elapsed;

pub use duration::DurationParseError;
pub use duration::parse_duration;
