pub mod buf;
pub mod worker_pool;
