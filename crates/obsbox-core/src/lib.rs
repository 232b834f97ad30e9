pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod publish;
pub mod registry;
pub mod topic;
pub mod transform;
pub mod types;
pub mod validate;
