pub mod properties;
pub mod shared;
