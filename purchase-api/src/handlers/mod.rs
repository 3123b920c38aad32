mod app;
mod ingest;
mod purchases;

pub use app::{app, AppState};
