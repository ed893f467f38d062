use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// Interest mask for an event object.
///
/// Unlike `mio::Interest` this mask has an empty value: an object registered
/// with `Events::NONE` is tracked by the reactor but has no OS-level watch.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READ: Events = Events(0b01);
    pub const WRITE: Events = Events(0b10);

    pub fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Events::READ), self.contains(Events::WRITE)) {
            (true, true) => write!(f, "READ|WRITE"),
            (true, false) => write!(f, "READ"),
            (false, true) => write!(f, "WRITE"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

/// Anything that can be registered with an event loop: it exposes a file
/// descriptor and receives readiness callbacks from the reactor.
///
/// `handle_read` and `handle_write` return `false` when the object is
/// unrecoverably broken; the reactor then calls `handle_error` and delivers
/// no further events to the object. `handle_error` is terminal and must not
/// re-enter the reactor for the same object.
pub trait EventObject: Send + Sync {
    /// The watched descriptor, or -1 for purely timer-driven objects.
    fn fd(&self) -> RawFd;

    /// Identity within the owning loop; -1 while unregistered.
    fn unique_id(&self) -> i32;
    fn set_unique_id(&self, id: i32);

    fn handle_read(&self) -> bool {
        true
    }

    fn handle_write(&self) -> bool {
        true
    }

    fn handle_error(&self) {}
}

/// Backing store for the `unique_id` accessors, so implementors only embed
/// one field.
pub struct ObjectId(AtomicI32);

impl ObjectId {
    pub fn new() -> ObjectId {
        ObjectId(AtomicI32::new(-1))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, id: i32) {
        self.0.store(id, Ordering::Relaxed);
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_mask_ops() {
        let both = Events::READ | Events::WRITE;
        assert!(both.contains(Events::READ));
        assert!(both.contains(Events::WRITE));
        assert!(!Events::READ.contains(Events::WRITE));
        assert!(Events::NONE.is_empty());
        assert!(!both.is_empty());
    }

    #[test]
    fn test_object_id_starts_unregistered() {
        let id = ObjectId::new();
        assert_eq!(id.get(), -1);
        id.set(7);
        assert_eq!(id.get(), 7);
    }
}
