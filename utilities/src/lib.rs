pub mod frame;
pub mod logger;
pub mod result;
pub mod retry_policy;
pub mod state_logger;
pub mod tcp_pool;
