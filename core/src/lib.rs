pub mod db;
pub mod estimator;
pub mod models;
pub mod serving;
