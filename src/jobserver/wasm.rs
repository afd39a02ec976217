//! Fallback jobserver token store for platforms with neither pipes nor
//! Win32 semaphores.
//!
//! A bare mutex-guarded counter. [`super::Jobserver::wait_acquire`] polls
//! `try_acquire` uniformly on every platform, so no wakeup/`Waker` registry
//! is needed here.

use std::io;
use std::sync::Mutex;

/// A plain counting token pool guarded by a mutex.
#[derive(Debug)]
pub struct Client {
    available: Mutex<usize>,
}

/// No per-token payload on this backend.
#[derive(Debug)]
pub struct Acquired;

impl Client {
    pub fn new(limit: usize) -> io::Result<Self> {
        Ok(Self {
            available: Mutex::new(limit),
        })
    }

    pub fn try_acquire(&self) -> io::Result<Option<Acquired>> {
        let mut available = self.available.lock().unwrap();
        if *available > 0 {
            *available -= 1;
            Ok(Some(Acquired))
        } else {
            Ok(None)
        }
    }

    pub fn release(&self, _data: Option<&Acquired>) -> io::Result<()> {
        *self.available.lock().unwrap() += 1;
        Ok(())
    }

    pub fn available(&self) -> io::Result<usize> {
        Ok(*self.available.lock().unwrap())
    }

    /// No child-process story on this backend; no-op.
    ///
    /// # Safety
    /// Trivially safe; kept `unsafe` to match the unix sibling's signature.
    pub unsafe fn allow_inherit(&self) -> io::Result<()> {
        Ok(())
    }

    pub fn fd_pair(&self) -> (i32, i32) {
        (0, 0)
    }
}
