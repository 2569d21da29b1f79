mod account;
mod food;
mod helpers;
mod summary;

pub(crate) use account::{cmd_goal, cmd_login, cmd_logout, cmd_me, cmd_register};
pub(crate) use food::{cmd_delete, cmd_log, cmd_recipe, cmd_scan, cmd_search, cmd_update};
pub(crate) use summary::{cmd_history, cmd_stats, cmd_today};
