//! gRPC transport layer for the CSI services.
//!
//! [`server::CsiService`] adapts any [`CsiIdentity`] + [`CsiController`] +
//! [`CsiNode`] implementation to the tonic-generated `Identity`,
//! `Controller` and `Node` services, and [`server::serve`] exposes them on
//! the Unix domain socket the container orchestrator dials.
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

pub mod convert;
pub mod server;
