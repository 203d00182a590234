pub mod check;
pub mod client;
pub mod serve;

pub use check::run_check;
pub use client::{run_listen, run_query};
pub use serve::run_serve;
