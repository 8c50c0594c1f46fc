//! Client bindings for the Griddle formula engine.
//!
//! Griddle is a native expression engine that parses and computes small
//! formula-like expressions: arithmetic, named variables, built-in and
//! caller-registered functions. The engine itself is a prebuilt shared
//! library; this crate loads it and puts a single evaluation entry point in
//! front of its three primitives.
//!
//! [`GriddleClient::evaluate`] inspects live registry state and the shape of
//! the supplied variables on every call: with any custom function registered
//! it awaits the custom-aware primitive, otherwise it completes immediately
//! through one of the two synchronous primitives, all behind one async
//! contract.
//!
//! ```no_run
//! use griddle_client::GriddleClient;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> griddle_client::Result<()> {
//!     let client = GriddleClient::connect()?;
//!     let total = client
//!         .evaluate("=SUM(:a, :b)", Some(json!({ "a": 10, "b": 5 })))
//!         .await?;
//!     println!("total = {total}");
//!     Ok(())
//! }
//! ```
//!
//! A registered custom function must settle its [`Completion`] exactly once.
//! A handler that never settles hangs the enclosing evaluation; that is the
//! engine's contract and this layer adds no watchdog over it.

pub mod binding;
pub mod client;
pub mod error;
pub mod loader;

pub use binding::{
    CallContext, Completion, CompletionResult, EngineBinding, FunctionHandler,
    FunctionRegistration, NativeBinding,
};
pub use client::GriddleClient;
pub use error::{GriddleError, LoadError, Result};
