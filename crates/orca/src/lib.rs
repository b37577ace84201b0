//! Orca workspace orchestration library.
//!
//! This library provides the core components for supervising Chromium-based
//! IDE workspaces and driving them over the Chrome DevTools Protocol.

pub mod api;
pub mod backend;
pub mod cdp;
pub mod events;
pub mod pending;
pub mod sync;
pub mod tunnel;
pub mod workspace;
