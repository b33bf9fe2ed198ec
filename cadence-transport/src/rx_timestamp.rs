//! Kernel receive timestamps for Linux sockets
//!
//! The kernel can stamp every received datagram as it enters the stack and
//! hand the stamp back as ancillary data on `recvmsg()`. This removes
//! scheduling delay between arrival and the user-space `recv()` return from
//! transit measurements.
//!
//! Two socket options are supported:
//! - `SO_TIMESTAMPING`: software RX stamps, plus raw NIC stamps on request
//! - `SO_TIMESTAMP`: legacy microsecond `timeval`, used when the first fails
//!
//! # References
//!
//! - Linux kernel timestamping docs: https://docs.kernel.org/networking/timestamping.html

use crate::{Error, Result, Timestamp};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

// =============================================================================
// Constants from linux/net_tstamp.h
// =============================================================================

/// Flags for SO_TIMESTAMPING
pub mod flags {
    /// Request RX hardware timestamps
    pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
    /// Request RX software timestamps
    pub const SOF_TIMESTAMPING_RX_SOFTWARE: u32 = 1 << 3;
    /// Report software timestamps
    pub const SOF_TIMESTAMPING_SOFTWARE: u32 = 1 << 4;
    /// Report RAW hardware timestamps
    pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;
}

/// Control message types
pub mod cmsg {
    pub const SCM_TIMESTAMPING: i32 = libc::SO_TIMESTAMPING;
    pub const SCM_TIMESTAMP: i32 = libc::SO_TIMESTAMP;
}

/// Buffer size for control messages (ancillary data)
pub const CMSG_BUFFER_SIZE: usize = 256;

// =============================================================================
// Structures
// =============================================================================

/// Timestamp triplet returned by SCM_TIMESTAMPING
///
/// `ts[0]` is the software stamp, `ts[1]` is deprecated and `ts[2]` is the raw
/// NIC stamp.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ScmTimestamping {
    pub ts: [libc::timespec; 3],
}

impl Default for ScmTimestamping {
    fn default() -> Self {
        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        Self { ts: [zero; 3] }
    }
}

fn is_set(ts: &libc::timespec) -> bool {
    ts.tv_sec != 0 || ts.tv_nsec != 0
}

impl ScmTimestamping {
    /// Best stamp in the `CLOCK_REALTIME` domain
    ///
    /// The raw NIC clock is only used when no software stamp is present, since
    /// it is not guaranteed to be synchronized with the system clock.
    pub fn wall_clock(&self) -> Option<Timestamp> {
        if is_set(&self.ts[0]) {
            Some(Timestamp::from_timespec(&self.ts[0]))
        } else if is_set(&self.ts[2]) {
            Some(Timestamp::from_timespec(&self.ts[2]))
        } else {
            None
        }
    }
}

/// Which kernel timestamping mechanism a socket ended up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxTimestamping {
    /// `SO_TIMESTAMPING`, with NIC stamps when `hardware` is set
    Timestamping { hardware: bool },
    /// Legacy `SO_TIMESTAMP`
    Timestamp,
}

// =============================================================================
// Socket Operations
// =============================================================================

fn setsockopt_u32(fd: RawFd, name: libc::c_int, value: u32) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            &value as *const u32 as *const libc::c_void,
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Enable kernel RX timestamps, falling back from `SO_TIMESTAMPING` to `SO_TIMESTAMP`
pub fn enable_rx_timestamping(fd: RawFd, hardware: bool) -> Result<RxTimestamping> {
    use flags::*;

    let mut ts_mode = SOF_TIMESTAMPING_RX_SOFTWARE | SOF_TIMESTAMPING_SOFTWARE;
    if hardware {
        ts_mode |= SOF_TIMESTAMPING_RX_HARDWARE | SOF_TIMESTAMPING_RAW_HARDWARE;
    }

    match setsockopt_u32(fd, libc::SO_TIMESTAMPING, ts_mode) {
        Ok(()) => return Ok(RxTimestamping::Timestamping { hardware }),
        Err(e) => tracing::debug!("SO_TIMESTAMPING unavailable ({}), trying SO_TIMESTAMP", e),
    }

    setsockopt_u32(fd, libc::SO_TIMESTAMP, 1).map_err(|e| {
        Error::Setup(format!("Failed to enable kernel receive timestamps: {e}"))
    })?;
    Ok(RxTimestamping::Timestamp)
}

/// Bind socket to a specific network interface
pub fn bind_to_device(fd: RawFd, interface: &str) -> Result<()> {
    // Kernel expects NUL-terminated string for SO_BINDTODEVICE
    let c_interface = std::ffi::CString::new(interface).map_err(|_| {
        Error::Setup(format!("Invalid interface name '{}': contains NUL byte", interface))
    })?;
    let bytes = c_interface.as_bytes_with_nul();

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len() as libc::socklen_t,
        )
    };

    if ret < 0 {
        return Err(Error::Setup(format!(
            "Failed to bind to device '{}': {}",
            interface,
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

// =============================================================================
// Timestamp Extraction from Control Messages
// =============================================================================

/// Extract the receive timestamp from the control messages of `hdr`
///
/// # Safety
///
/// `hdr.msg_control` must point to a buffer of at least `hdr.msg_controllen`
/// bytes filled in by `recvmsg()`.
pub unsafe fn extract_rx_timestamp(hdr: &libc::msghdr) -> Option<Timestamp> {
    let mut cmsg_ptr = libc::CMSG_FIRSTHDR(hdr);
    while !cmsg_ptr.is_null() {
        let header = &*cmsg_ptr;
        if header.cmsg_level == libc::SOL_SOCKET {
            let data = libc::CMSG_DATA(cmsg_ptr);
            match header.cmsg_type {
                cmsg::SCM_TIMESTAMPING => {
                    let scm = std::ptr::read_unaligned(data as *const ScmTimestamping);
                    if let Some(ts) = scm.wall_clock() {
                        return Some(ts);
                    }
                }
                cmsg::SCM_TIMESTAMP => {
                    let tv = std::ptr::read_unaligned(data as *const libc::timeval);
                    return Some(Timestamp::from_timeval(&tv));
                }
                _ => {}
            }
        }
        cmsg_ptr = libc::CMSG_NXTHDR(hdr, cmsg_ptr);
    }
    None
}

/// Receive data with timestamps via recvmsg
///
/// Returns (bytes_read, optional_kernel_timestamp).
pub fn recvmsg_with_timestamp(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
) -> io::Result<(usize, Option<Timestamp>)> {
    recvmsg_inner(fd, buf, flags, std::ptr::null_mut(), 0)
}

/// [`recvmsg_with_timestamp`] that also fills in the sender address
///
/// `source` receives the raw socket address the kernel reports, such as a
/// `sockaddr_ll` on a packet socket.
pub fn recvmsg_with_source<A: Copy>(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    source: &mut A,
) -> io::Result<(usize, Option<Timestamp>)> {
    recvmsg_inner(
        fd,
        buf,
        flags,
        source as *mut A as *mut libc::c_void,
        mem::size_of::<A>() as libc::socklen_t,
    )
}

fn recvmsg_inner(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    name: *mut libc::c_void,
    namelen: libc::socklen_t,
) -> io::Result<(usize, Option<Timestamp>)> {
    // u64 storage keeps the control buffer aligned for cmsghdr
    let mut cmsg_buf = [0u64; CMSG_BUFFER_SIZE / 8];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    hdr.msg_name = name;
    hdr.msg_namelen = namelen;
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    hdr.msg_controllen = CMSG_BUFFER_SIZE as _;

    let n = unsafe { libc::recvmsg(fd, &mut hdr, flags) };

    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let timestamp = unsafe { extract_rx_timestamp(&hdr) };

    Ok((n as usize, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::os::unix::io::AsRawFd;

    /// Lay out a single control message the way the kernel does
    fn with_cmsg<T: Copy>(cmsg_type: i32, payload: T, check: impl FnOnce(&libc::msghdr)) {
        let mut storage = [0u64; CMSG_BUFFER_SIZE / 8];
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_control = storage.as_mut_ptr() as *mut libc::c_void;
        unsafe {
            hdr.msg_controllen = libc::CMSG_SPACE(mem::size_of::<T>() as u32) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = cmsg_type;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<T>() as u32) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut T, payload);
        }
        check(&hdr);
    }

    #[test]
    fn test_scm_timestamping_prefers_software() {
        let mut scm = ScmTimestamping::default();
        assert!(scm.wall_clock().is_none());

        scm.ts[2].tv_sec = 2000;
        assert_eq!(scm.wall_clock().unwrap().sec(), 2000);

        scm.ts[0].tv_sec = 1000;
        scm.ts[0].tv_nsec = 500_000;
        let ts = scm.wall_clock().unwrap();
        assert_eq!((ts.sec(), ts.usec()), (1000, 500));
    }

    #[test]
    fn test_extract_scm_timestamping() {
        let mut scm = ScmTimestamping::default();
        scm.ts[0] = libc::timespec { tv_sec: 1_700_000_000, tv_nsec: 42_000 };
        with_cmsg(cmsg::SCM_TIMESTAMPING, scm, |hdr| {
            let ts = unsafe { extract_rx_timestamp(hdr) }.unwrap();
            assert_eq!((ts.sec(), ts.usec()), (1_700_000_000, 42));
        });
    }

    #[test]
    fn test_extract_scm_timestamp() {
        let tv = libc::timeval { tv_sec: 12, tv_usec: 345 };
        with_cmsg(cmsg::SCM_TIMESTAMP, tv, |hdr| {
            let ts = unsafe { extract_rx_timestamp(hdr) }.unwrap();
            assert_eq!((ts.sec(), ts.usec()), (12, 345));
        });
    }

    #[test]
    fn test_ignores_other_cmsgs() {
        with_cmsg(libc::SCM_RIGHTS, 0i32, |hdr| {
            assert!(unsafe { extract_rx_timestamp(hdr) }.is_none());
        });
    }

    #[test]
    fn test_loopback_kernel_timestamp() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        enable_rx_timestamping(rx.as_raw_fd(), false).unwrap();

        let before = Timestamp::now();
        tx.send_to(b"ping", rx.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let (n, ts) = recvmsg_with_timestamp(rx.as_raw_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"ping");
        let ts = ts.expect("kernel timestamp on loopback");
        let delta = ts.sub_secs(&before);
        assert!(delta > -0.001 && delta < 1.0, "delta = {delta}");
    }

    #[test]
    fn test_recvmsg_reports_source() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(b"pong", rx.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let mut source: libc::sockaddr_in = unsafe { mem::zeroed() };
        let (n, ts) = recvmsg_with_source(rx.as_raw_fd(), &mut buf, 0, &mut source).unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert!(ts.is_none());
        assert_eq!(u16::from_be(source.sin_port), tx.local_addr().unwrap().port());
    }
}
