//! Anonymous-pipe jobserver token store, unix flavor.
//!
//! A pipe is pre-filled with one byte per token; acquisition is a one-byte
//! read, release is a one-byte write. This engine is always the root of its
//! own token pool, so there is no fifo or inherited-jobserver attach path
//! here, only the pipe it creates itself.

use std::{
    fs::File,
    io::{self, Read, Write},
    mem::MaybeUninit,
    os::unix::prelude::*,
};

use libc::c_int;

/// Read/write ends of the token pipe.
#[derive(Debug)]
pub struct Client {
    read: File,
    write: File,
}

/// A single token byte, preserved so `release` can hand back the exact byte
/// it was handed (GNU make tokens are not always `+`).
#[derive(Debug)]
pub struct Acquired {
    byte: u8,
}

impl Client {
    pub fn new(limit: usize) -> io::Result<Self> {
        let pipes = create_pipe()?;
        let client = unsafe { Self::from_fds(pipes[0], pipes[1]) };
        client.init(limit)?;
        set_nonblocking(client.read.as_raw_fd())?;
        Ok(client)
    }

    fn init(&self, mut limit: usize) -> io::Result<()> {
        const BUFFER: [u8; 128] = [b'+'; 128];
        while limit > 0 {
            let n = limit.min(BUFFER.len());
            (&self.write).write_all(&BUFFER[..n])?;
            limit -= n;
        }
        Ok(())
    }

    unsafe fn from_fds(read: c_int, write: c_int) -> Self {
        Self {
            read: File::from_raw_fd(read),
            write: File::from_raw_fd(write),
        }
    }

    /// Non-blocking: the read end is always `O_NONBLOCK`, so this never
    /// actually blocks the calling thread.
    pub fn try_acquire(&self) -> io::Result<Option<Acquired>> {
        let mut buf = [0u8];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(1) => return Ok(Some(Acquired { byte: buf[0] })),
                Ok(_) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn release(&self, data: Option<&Acquired>) -> io::Result<()> {
        let byte = data.map(|d| d.byte).unwrap_or(b'+');
        match (&self.write).write(&[byte])? {
            1 => Ok(()),
            _ => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
        }
    }

    /// Bytes currently sitting in the pipe, unread — i.e. tokens nobody has
    /// checked out. Used only as a debug-build cross-check against the
    /// atomic counter in [`super::Jobserver`].
    pub fn available(&self) -> io::Result<usize> {
        let mut len = MaybeUninit::<c_int>::uninit();
        cvt(unsafe { libc::ioctl(self.read.as_raw_fd(), libc::FIONREAD, len.as_mut_ptr()) })?;
        Ok(unsafe { len.assume_init() }.try_into().unwrap_or(0))
    }

    /// The `R,W` fd pair GNU make expects in `--jobserver-fds=R,W`.
    pub fn fd_pair(&self) -> (RawFd, RawFd) {
        (self.read.as_raw_fd(), self.write.as_raw_fd())
    }

    /// Clears `FD_CLOEXEC` on both ends so a spawned `make` child inherits
    /// them across `exec`. Must be called from the child's pre-exec hook.
    ///
    /// # Safety
    /// Only safe to call between `fork` and `exec` in a child process, same
    /// restrictions as `std::os::unix::process::CommandExt::pre_exec`.
    pub unsafe fn allow_inherit(&self) -> io::Result<()> {
        set_cloexec(self.read.as_raw_fd(), false)?;
        set_cloexec(self.write.as_raw_fd(), false)?;
        Ok(())
    }
}

fn create_pipe() -> io::Result<[RawFd; 2]> {
    let mut pipes = [0; 2];
    cvt(unsafe { libc::pipe(pipes.as_mut_ptr()) })?;
    set_cloexec(pipes[0], true)?;
    set_cloexec(pipes[1], true)?;
    Ok(pipes)
}

fn set_cloexec(fd: c_int, set: bool) -> io::Result<()> {
    let flag = if set { libc::FD_CLOEXEC } else { 0 };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flag) })?;
    Ok(())
}

fn set_nonblocking(fd: c_int) -> io::Result<()> {
    let cur = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, cur | libc::O_NONBLOCK) })?;
    Ok(())
}

fn cvt(t: c_int) -> io::Result<c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}
