pub mod adapter;
pub mod reader;
