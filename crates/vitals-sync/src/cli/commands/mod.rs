pub mod backend;
pub mod sync;

pub use backend::{aggregate, serve};
pub use sync::{dashboard, run as sync_run, status as sync_status};
