//! `SCM_RIGHTS` descriptor passing on Unix stream sockets.
//!
//! Thin wrappers over `sendmsg`/`recvmsg`. They operate on non-blocking
//! sockets and surface `WouldBlock`, so callers drive them from the async
//! reactor.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr;

/// Most descriptors accepted from a single `recvmsg`. One is legal per
/// message; the extra room lets the caller see that a peer sent too many
/// instead of having them silently discarded.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

// u64 words keep the control buffer aligned for cmsghdr.
const CONTROL_WORDS: usize = 16;

/// Result of one `recvmsg` call.
#[derive(Debug)]
pub struct Received {
    /// Bytes placed in the caller's buffer; zero means end of file.
    pub len: usize,
    /// Descriptors that arrived with those bytes, already close-on-exec.
    pub fds: Vec<OwnedFd>,
    /// The kernel had to discard control data.
    pub truncated: bool,
}

fn control_space(fd_count: usize) -> usize {
    unsafe { libc::CMSG_SPACE((fd_count * mem::size_of::<libc::c_int>()) as libc::c_uint) as usize }
}

/// Send `data` with `fds` attached as ancillary data.
///
/// Returns the number of bytes the kernel accepted. The descriptors travel
/// with the first byte, so on a short write the caller sends the remainder
/// as plain bytes. The caller keeps ownership of `fds`.
pub fn send_with_fds(sock: BorrowedFd<'_>, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut control = [0u64; CONTROL_WORDS];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let space = control_space(fds.len());
        if space > mem::size_of_val(&control) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "too many descriptors for one message",
            ));
        }
        let payload_len = (fds.len() * mem::size_of::<libc::c_int>()) as libc::c_uint;

        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len) as _;
            let data = libc::CMSG_DATA(cmsg) as *mut libc::c_int;
            for (i, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(data.add(i), fd.as_raw_fd());
            }
        }
    }

    let sent = unsafe { libc::sendmsg(sock.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sent as usize)
}

/// Receive into `buf`, collecting any descriptors that ride along.
pub fn recv_with_fds(sock: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<Received> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut control = [0u64; CONTROL_WORDS];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control_space(MAX_FDS_PER_MESSAGE) as _;

    let len = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if len < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let header_len = data as usize - cmsg as usize;
                let payload_len = ((*cmsg).cmsg_len as usize).saturating_sub(header_len);
                let count = payload_len / mem::size_of::<libc::c_int>();
                for i in 0..count {
                    let raw = ptr::read_unaligned((data as *const libc::c_int).add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Received {
        len: len as usize,
        fds,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
    })
}
