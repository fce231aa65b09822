pub mod crud;
pub mod index;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod model;
