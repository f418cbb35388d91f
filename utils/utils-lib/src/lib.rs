pub mod constants;
pub use constants::*;

pub mod tracing_telemetry;

/// Get the package description, suitable for a clap `name`.
#[macro_export]
macro_rules! package_description {
    () => {
        env!("CARGO_PKG_DESCRIPTION")
    };
}
