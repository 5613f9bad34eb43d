pub mod api;
pub mod cli;
pub mod database_ops;
pub mod stores;
pub mod tracing;
pub mod window;

pub mod util {
    pub mod db;
    pub mod env;
    pub mod text;
}
