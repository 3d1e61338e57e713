//! Ref-counted owners for server-side and GPU resources
//!
//! A window's texture or picture can outlive the window (a fade plugin
//! keeps drawing it after unmap). Every such object is wrapped in a
//! [`Resource`] and shared as a [`ResourceHandle`]; the last drop releases
//! it through the [`ResourceReleaser`] that created it.

use std::fmt;
use std::rc::Rc;

/// What a resource id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pixmap,
    Picture,
    Damage,
    GlxPixmap,
    Texture,
    Buffer,
}

/// Frees resources of the kinds it hands out.
pub trait ResourceReleaser {
    fn release(&self, kind: ResourceKind, id: u32);
}

/// An owned back-end object, released on drop.
pub struct Resource {
    kind: ResourceKind,
    id: u32,
    releaser: Rc<dyn ResourceReleaser>,
}

pub type ResourceHandle = Rc<Resource>;

impl Resource {
    pub fn new(kind: ResourceKind, id: u32, releaser: Rc<dyn ResourceReleaser>) -> ResourceHandle {
        Rc::new(Self { kind, id, releaser })
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(0x{:x})", self.kind, self.id)
    }
}

impl Drop for Resource {
    fn drop(&mut self) {
        self.releaser.release(self.kind, self.id);
    }
}

/// Id of an optional handle, `0` (X's `None`) when absent.
pub fn id_or_none(handle: Option<&ResourceHandle>) -> u32 {
    handle.map(|h| h.id()).unwrap_or(x11rb::NONE)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Records releases instead of talking to a server.
    #[derive(Default)]
    pub struct RecordingReleaser {
        pub released: RefCell<Vec<(ResourceKind, u32)>>,
    }

    impl ResourceReleaser for RecordingReleaser {
        fn release(&self, kind: ResourceKind, id: u32) {
            self.released.borrow_mut().push((kind, id));
        }
    }
}
