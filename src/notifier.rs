//! Self-pipe wake-up for the event loop.
//!
//! Other threads post work to a loop and then kick this pipe so the loop
//! falls out of its poll. Wakes are collapsible: the loop only needs to be
//! woken, not counted, so a full pipe means a wake is already pending and
//! the extra byte may be dropped.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use mio::unix::pipe;
use tracing::error;

use crate::error::Result;
use crate::event::{EventObject, ObjectId};

/// Write side, shared with submitting threads.
pub(crate) struct Notifier {
    sender: pipe::Sender,
}

/// Read side, registered with the reactor as an event object.
pub(crate) struct NotifyReceiver {
    receiver: pipe::Receiver,
    id: ObjectId,
}

impl Notifier {
    pub fn new() -> Result<(Notifier, NotifyReceiver)> {
        let (sender, receiver) = pipe::new()?;
        Ok((
            Notifier { sender },
            NotifyReceiver {
                receiver,
                id: ObjectId::new(),
            },
        ))
    }

    /// Wake the loop. Returns false only if the pipe is truly broken.
    pub fn notify(&self) -> bool {
        match (&self.sender).write(&[0u8]) {
            Ok(n) => n == 1,
            // Pipe full: a wake is already pending.
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(e) => {
                error!("notifier write failed: {e}");
                false
            }
        }
    }
}

impl EventObject for NotifyReceiver {
    fn fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }

    fn unique_id(&self) -> i32 {
        self.id.get()
    }

    fn set_unique_id(&self, id: i32) {
        self.id.set(id);
    }

    fn handle_read(&self) -> bool {
        // Drain everything; the poll is edge-triggered.
        let mut buf = [0u8; 64];
        loop {
            match (&self.receiver).read(&mut buf) {
                Ok(0) => return false, // write end closed
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("notifier read failed: {e}");
                    return false;
                }
            }
        }
    }

    fn handle_write(&self) -> bool {
        debug_assert!(false, "notifier never watches for writability");
        false
    }

    fn handle_error(&self) {
        error!("notifier pipe failed");
    }
}
