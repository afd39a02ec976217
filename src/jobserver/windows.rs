//! Named-less semaphore jobserver token store, Windows flavor.
//!
//! This engine never hands its token store to a process outside the one
//! that created it, so a plain anonymous semaphore is enough; no named,
//! globally-discoverable handle is needed.

use std::{
    io,
    os::windows::io::{AsRawHandle, HandleOrNull, OwnedHandle},
    ptr,
};

use windows_sys::Win32::Foundation::{WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreA, ReleaseSemaphore, WaitForSingleObject,
};

/// A Windows semaphore handle standing in for the token pipe.
#[derive(Debug)]
pub struct Client {
    sem: OwnedHandle,
}

/// Windows has no per-token payload; a semaphore slot is fungible.
#[derive(Debug)]
pub struct Acquired;

impl Client {
    pub fn new(limit: usize) -> io::Result<Self> {
        let limit: i32 = limit
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "jobserver limit too large"))?;

        let sem: io::Result<OwnedHandle> = unsafe {
            HandleOrNull::from_raw_handle(CreateSemaphoreA(ptr::null_mut(), limit, limit, ptr::null()))
        }
        .try_into()
        .map_err(|_| io::Error::last_os_error());

        Ok(Self { sem: sem? })
    }

    pub fn try_acquire(&self) -> io::Result<Option<Acquired>> {
        match unsafe { WaitForSingleObject(self.sem.as_raw_handle(), 0) } {
            WAIT_OBJECT_0 => Ok(Some(Acquired)),
            WAIT_TIMEOUT => Ok(None),
            WAIT_FAILED => Err(io::Error::last_os_error()),
            ret => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected WaitForSingleObject result {ret:#x}"),
            )),
        }
    }

    pub fn release(&self, _data: Option<&Acquired>) -> io::Result<()> {
        let r = unsafe { ReleaseSemaphore(self.sem.as_raw_handle(), 1, ptr::null_mut()) };
        if r != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// No FD-readable-bytes primitive on Windows; acquire-then-release to
    /// observe the previous count instead.
    pub fn available(&self) -> io::Result<usize> {
        if self.try_acquire()?.is_some() {
            self.release(None)?;
            Ok(1)
        } else {
            Ok(0)
        }
    }

    /// No child-process fd inheritance story on this platform; no-op.
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
