#[cfg(feature = "data")]
pub mod data;
#[cfg(feature = "store")]
pub mod store;
