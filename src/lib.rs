//! Writable chunk streams for Rust
//!
//! This crate provides the writable half of a streams abstraction: a
//! destination for chunks of data produced by a caller and consumed serially
//! by an underlying sink. It coordinates a producer, a sized queue, and an
//! async sink through a small state machine with backpressure signalling and
//! a single-writer lock.
//!
//! ## Features
//!
//! - **`send` (default)**: Multi-threaded streams using `Arc` (requires `Send`)
//! - **`local`**: Single-threaded streams using `Rc` (no `Send` required)
//!
//! ## Multi-threaded (default)
//!
//! ```toml
//! [dependencies]
//! writable-streams = "0.1"
//! ```
//!
//! ## Single-threaded (WASM or LocalSet)
//!
//! ```toml
//! [dependencies]
//! writable-streams = { version = "0.1", default-features = false, features = ["local"] }
//! ```

// Ensure mutual exclusion of features
#[cfg(all(feature = "send", feature = "local"))]
compile_error!(
    "Features 'send' and 'local' are mutually exclusive.\n\
     For multi-threaded: cargo build --features send\n\
     For single-threaded: cargo build --no-default-features --features local"
);

// Ensure at least one feature is enabled
#[cfg(not(any(feature = "send", feature = "local")))]
compile_error!(
    "Must enable either 'send' or 'local' feature.\n\
     For multi-threaded (default): cargo build\n\
     For single-threaded: cargo build --no-default-features --features local"
);

// Platform abstraction layer
mod platform;

// Stream implementation
pub mod streams;

// Re-export everything from streams
pub use streams::*;
