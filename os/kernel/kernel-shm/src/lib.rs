//! # Shared Memory Objects
//!
//! A global catalogue of named memory regions that processes share by
//! mapping the same physical frames.
//!
//! * An object is identified by its owner and a name unique for that owner.
//! * [`ShareRegistry::create`] allocates one frame per page and maps them
//!   into the creator; [`ShareRegistry::get`] maps the *same* frames into a
//!   consumer. Nothing is copied.
//! * Every mapping holds a reference on a frame, and the registry holds one
//!   more while the object exists. [`ShareRegistry::delete`] drops a
//!   process's mapping and, with the last reference, the object and its frames.
//!
//! Failures are ordinary [`ShareError`] values, which user space sees as the
//! negative status codes from [`ShareError::status_code`].

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod registry;

pub use registry::{ShareRegistry, SharedObject};

use core::fmt;
use kernel_vmem::VmemError;

/// Longest name stored for an object; longer names are truncated.
pub const MAX_SHARE_NAME_LEN: usize = 63;

/// No memory left for a new object.
pub const E_NO_SHARE: i32 = -21;
/// An object with this owner and name already exists.
pub const E_SHARED_MEM_EXISTS: i32 = -22;
/// No object with this owner and name exists.
pub const E_SHARED_MEM_NOT_EXISTS: i32 = -23;

/// Identity of the process owning an object.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OwnerId(pub u32);

/// Registry-assigned object identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ShareId(u32);

impl ShareId {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareId({})", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ShareError {
    #[error("shared object already exists")]
    AlreadyExists,
    #[error("shared object does not exist")]
    NotFound,
    #[error("no memory for shared object")]
    NoShare,
    #[error("failed to map shared object: {0}")]
    Map(#[from] VmemError),
}

impl ShareError {
    /// Status code reported to user space.
    #[must_use]
    pub const fn status_code(self) -> i32 {
        match self {
            Self::AlreadyExists => E_SHARED_MEM_EXISTS,
            Self::NotFound => E_SHARED_MEM_NOT_EXISTS,
            Self::NoShare | Self::Map(_) => E_NO_SHARE,
        }
    }
}
