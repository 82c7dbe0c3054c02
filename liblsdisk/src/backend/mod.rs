//! Storage backend implementation.
//!
//! [`lsdisk::LsdiskBackend`] implements [`CsiIdentity`], [`CsiController`],
//! and [`CsiNode`] on top of the host-side [`store::VolumeStore`].
//!
//! [`CsiIdentity`]: crate::identity::CsiIdentity
//! [`CsiController`]: crate::controller::CsiController
//! [`CsiNode`]: crate::node::CsiNode

pub mod lsdisk;
pub mod store;
