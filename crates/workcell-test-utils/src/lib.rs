//! Shared test utilities for workcell integration tests.
//!
//! This crate provides:
//! - [`TestWorkcell`]: A wired, running in-memory orchestrator
//! - [`TracingMemoryBackend`]: Lock storage with operation recording and fault injection
//! - [`FaultyRunStore`]: Run store whose call writes and run saves can fail
//! - [`TestDevice`] and step factories
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use workcell_test_utils::{TestWorkcell, echo_step, step_key, assert_run_completed};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cell = TestWorkcell::builder().step(echo_step("hello")).start();
//!     let run_id = cell.orchestrator.submit_run(step_key("hello"), Default::default(), Default::default()).await.unwrap();
//!     assert_run_completed(&cell.wait_for_settled(run_id).await);
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod harness;
pub mod storage;
pub mod store;

pub use assertions::*;
pub use fixtures::*;
pub use harness::*;
pub use storage::*;
pub use store::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("workcell_flow=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
