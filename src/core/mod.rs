// Task fan-out primitives shared by batch operations

pub mod executor;

pub use executor::*;
