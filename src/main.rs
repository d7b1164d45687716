//! Convergence engine binary entry point.
//!
//! `dotenv` then `tracing` init up front, a `Result<()>`-returning `main`
//! via `#[tokio::main]`, real work delegated to typed modules rather than
//! inlined here.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    convergence_core::telemetry::init_tracing();

    convergence_core::cli::execute().await
}
