//! Process-wide tracing setup shared by binaries and tests.

/// Install the global subscriber.
///
/// Safe to call more than once; only the first call installs anything, so
/// every test can call it from its own setup.
pub fn init() {
    tracing::init();
}

/// Subscriber construction (filter, output format).
pub mod tracing;
