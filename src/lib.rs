pub mod args;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod sink;
pub mod text;
