// HTTP API over the synced sales data: sync triggers, reports and chat.

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
