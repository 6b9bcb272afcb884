pub mod broker;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod job;
pub mod shutdown;
pub mod sink;
pub mod status;
pub mod worker;
