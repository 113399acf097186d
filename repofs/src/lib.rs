//! repofs exposes a remote document repository as a local filesystem.
//!
//! The repository is slow and remote, so everything the kernel asks for is
//! answered from an in-memory metadata cache. A background refresher keeps
//! the cache honest for the parts of the tree the user actually has open;
//! mutations update the cache in the same call that changes the remote.

pub mod cache;
pub mod config;
pub mod fsops;
pub mod fuse;
pub mod pathutil;
pub mod refresh;
pub mod remote;
