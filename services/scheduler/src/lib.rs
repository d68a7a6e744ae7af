//! halyard scheduler library.
//!
//! This crate primarily ships the `halyard` binary, but exposes its
//! components so they can be wired together by integration tests.

pub mod api;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod offers;
pub mod ports;
pub mod scale;
pub mod state;
pub mod supervisor;
pub mod task;
