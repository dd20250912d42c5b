/// Network structs and types.
pub mod transport;

/// Unit types, such as [DataSize](units::DataSize) and [DataRate](units::DataRate).
pub mod units;
