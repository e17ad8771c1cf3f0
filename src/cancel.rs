//! Cancellation context shared between a controller and its workers.
//!
//! A token pairs an atomic flag with an `eventfd(2)` descriptor. Workers that
//! block on `poll(2)` put the descriptor in their poll set so that
//! [`CancellationToken::cancel`] wakes them up immediately; workers that block
//! elsewhere check [`CancellationToken::is_cancelled`].

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct Shared {
    cancelled: AtomicBool,
    wakeup: OwnedFd,
}

/// Cloneable handle to a shared cancellation flag and wakeup descriptor.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl CancellationToken {
    /// Create a fresh, not yet cancelled token.
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                wakeup: unsafe { OwnedFd::from_raw_fd(fd) },
            }),
        })
    }

    /// Set the flag and make the wakeup descriptor readable.
    ///
    /// Calling this more than once is harmless.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.shared.wakeup.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            log::warn!(
                "failed to signal cancellation wakeup: {}",
                io::Error::last_os_error()
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Consume a pending wakeup so the descriptor stops polling readable.
    ///
    /// The flag stays set.
    pub fn drain(&self) {
        let mut counter: u64 = 0;
        unsafe {
            libc::read(
                self.shared.wakeup.as_raw_fd(),
                &mut counter as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl AsFd for CancellationToken {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.shared.wakeup.as_fd()
    }
}
