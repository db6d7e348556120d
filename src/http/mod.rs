//! HTTP layer of the package proxy.
//!
//! The router in [`handler`] installs the request pipeline from
//! [`pipeline`] as a middleware; [`tee`] streams origin bodies to the client
//! while capturing cache fills.

pub mod handler;
pub mod pipeline;
pub mod tee;
