pub mod cron;
pub mod watch;

pub use cron::{CronDispatcher, CronExpr};
pub use watch::WatchDispatcher;
