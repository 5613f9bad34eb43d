pub mod export;
pub mod gemini;
pub mod linisco;
pub mod reports;
pub mod upsert;
