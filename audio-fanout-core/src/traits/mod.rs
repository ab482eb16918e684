pub mod capture_pump;
pub mod capture_source;
pub mod delegate;
pub mod services;
