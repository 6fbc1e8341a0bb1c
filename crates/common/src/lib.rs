pub mod domain;
pub mod postgres;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockReadingSink;
