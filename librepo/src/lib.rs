//! Client for the file API of a remote document repository.
//!
//! The repository stores a tree of documents behind an HTTP endpoint that is
//! guarded by basic auth plus a session CSRF token. This crate speaks that
//! protocol and nothing else; caching and filesystem semantics live in the
//! `repofs` crate on top of it.

pub mod client;
pub mod error;
pub mod types;

pub use client::{ClientOptions, RepoClient};
pub use error::{Error, Result};
