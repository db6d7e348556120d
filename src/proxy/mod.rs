//! Origin side of the proxy.
//!
//! Requests leave through a [`transport::Transport`], wrapped in
//! [`redirect::FollowRedirect`] and driven by [`failover::MirrorFailover`].
//! Headers crossing the proxy in either direction go through the fixed
//! allow-lists in [`headers`].

pub mod failover;
pub mod headers;
pub mod redirect;
pub mod transport;
