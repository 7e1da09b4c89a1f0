//! Async access to the host-supplied TUN descriptor.
//!
//! The host (a Network Extension on iOS) owns the descriptor. The engine
//! switches it to non-blocking mode for the time it is attached and restores
//! the original flags on drop, but never closes it.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use tokio::io::unix::AsyncFd;

use crate::error::{EngineError, EngineResult};

/// Length of the utun packet-information header.
const PI_HEADER_LEN: usize = 4;

/// Check that `fd` refers to an open descriptor.
pub fn validate_fd(fd: RawFd) -> EngineResult<()> {
    if fd < 0 {
        return Err(EngineError::InvalidDescriptor(format!(
            "descriptor {} is negative",
            fd
        )));
    }
    // SAFETY: F_GETFL only queries flags; an invalid fd yields -1/EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(EngineError::InvalidDescriptor(format!(
            "descriptor {} is not open: {}",
            fd,
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Non-owning handle on a raw descriptor.
#[derive(Debug)]
struct BorrowedTun {
    fd: RawFd,
    original_flags: libc::c_int,
}

impl AsRawFd for BorrowedTun {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for BorrowedTun {
    fn drop(&mut self) {
        // SAFETY: restores flags we read at attach time; the descriptor is
        // still owned by the host.
        unsafe {
            libc::fcntl(self.fd, libc::F_SETFL, self.original_flags);
        }
    }
}

/// The host TUN descriptor registered with the tokio reactor.
#[derive(Debug)]
pub struct TunDevice {
    inner: AsyncFd<BorrowedTun>,
    packet_info: bool,
    mtu: usize,
}

impl TunDevice {
    /// Attach to `fd`. Must be called inside a tokio runtime.
    ///
    /// `packet_info` selects the Darwin utun framing: every packet carries a
    /// 4-byte big-endian address family in front of the IP header.
    pub fn attach(fd: RawFd, packet_info: bool, mtu: u16) -> EngineResult<Self> {
        validate_fd(fd)?;

        // SAFETY: fd was validated above.
        let original_flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if original_flags < 0 {
            return Err(EngineError::InvalidDescriptor(
                io::Error::last_os_error().to_string(),
            ));
        }
        // SAFETY: only adds O_NONBLOCK to the flags just read.
        if unsafe { libc::fcntl(fd, libc::F_SETFL, original_flags | libc::O_NONBLOCK) } < 0 {
            return Err(EngineError::InvalidDescriptor(format!(
                "cannot make descriptor {} non-blocking: {}",
                fd,
                io::Error::last_os_error()
            )));
        }

        let inner = AsyncFd::new(BorrowedTun { fd, original_flags }).map_err(|e| {
            EngineError::InvalidDescriptor(format!("cannot register descriptor {}: {}", fd, e))
        })?;

        Ok(Self {
            inner,
            packet_info,
            mtu: mtu as usize,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.get_ref().fd
    }

    /// Buffer size large enough for one read.
    pub fn buffer_size(&self) -> usize {
        self.mtu + PI_HEADER_LEN + 64
    }

    /// Read one packet. The returned slice excludes the packet-information
    /// header and may be empty for runt reads. EOF is an error.
    pub async fn read_packet<'a>(&self, buf: &'a mut [u8]) -> io::Result<&'a [u8]> {
        let n = loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().fd;
                // SAFETY: buf is a valid writable region of buf.len() bytes.
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => break result?,
                Err(_would_block) => continue,
            }
        };

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "TUN descriptor closed",
            ));
        }
        if self.packet_info {
            if n <= PI_HEADER_LEN {
                return Ok(&buf[..0]);
            }
            return Ok(&buf[PI_HEADER_LEN..n]);
        }
        Ok(&buf[..n])
    }

    /// Write one IP packet, prepending the packet-information header when
    /// configured.
    pub async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let framed;
        let data: &[u8] = if self.packet_info {
            let mut buf = Vec::with_capacity(PI_HEADER_LEN + packet.len());
            buf.extend_from_slice(&address_family(packet).to_be_bytes());
            buf.extend_from_slice(packet);
            framed = buf;
            &framed
        } else {
            packet
        };

        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().fd;
                // SAFETY: data is a valid readable region of data.len() bytes.
                let n =
                    unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => {
                    let written = result?;
                    if written != data.len() {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            format!("short TUN write: {} of {} bytes", written, data.len()),
                        ));
                    }
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

/// Address family for the utun header, from the IP version nibble.
fn address_family(packet: &[u8]) -> u32 {
    match packet.first().map(|b| b >> 4) {
        Some(6) => libc::AF_INET6 as u32,
        _ => libc::AF_INET as u32,
    }
}
