pub mod config;
pub mod journal;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod runner;
pub mod store;
pub mod sweeper;
pub mod trigger;
pub mod validator;
