use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Wake-up descriptor backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8 bytes
/// (64 bits) and are converted (native endian) into a 64 bit unsigned integer
/// and added to the count. Reads must also be 8 bytes and reset the count to
/// 0, returning the count. That collapses any number of concurrent wake-ups
/// into a single readiness event, which is fine: the consumer drains its
/// whole task queue after waking.
#[derive(Debug)]
pub struct Awakener {
    fd: File,
}

impl Awakener {
    pub fn new() -> io::Result<Awakener> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Awakener {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Add one to the counter, making the descriptor readable.
    pub fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        let n = (&self.fd).write(&buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("eventfd write returned {} bytes instead of 8", n),
            ));
        }
        Ok(())
    }

    /// Read and reset the counter. Returns the number of wake-ups collapsed
    /// into this read, or 0 if the descriptor wasn't readable.
    pub fn drain(&self) -> io::Result<u64> {
        let mut buf = [0; 8];
        match (&self.fd).read(&mut buf) {
            Ok(8) => Ok(u64::from_ne_bytes(buf)),
            // If the `Awakener` hasn't been awoken yet this will return a
            // `WouldBlock` error which we can safely ignore.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Ok(n) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("eventfd read returned {} bytes instead of 8", n),
            )),
            Err(err) => Err(err),
        }
    }
}
