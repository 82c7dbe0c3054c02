//! Host resource engine.
//!
//! Each component owns one kind of host resource and is idempotent on its
//! own: re-running an operation with the same arguments converges instead of
//! duplicating state.  None of them takes locks; serialisation is the job of
//! the backend that composes them.

pub mod disk;
pub mod image;
pub mod loopdev;
pub mod mount;

pub use disk::{BlockDevice, DiskSelector};
pub use image::ImageManager;
pub use loopdev::LoopManager;
pub use mount::MountManager;
