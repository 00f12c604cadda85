//! Sealed anonymous memory files backing frame payloads.
//!
//! Every frame gets its own `memfd`. Once the payload is written the file is
//! sealed against writes and resizing, so the bytes a client maps can never
//! change underneath it, however long it keeps the frame.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

const MEMFD_NAME: &str = "framebus-frame";

const FRAME_SEALS: libc::c_int =
    libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;

/// Identity of a backing memory object (device and inode of the memfd).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryIdentity {
    pub dev: u64,
    pub ino: u64,
}

/// Payload of one frame, held in a sealed memfd.
#[derive(Debug)]
pub struct FrameMemory {
    fd: OwnedFd,
    len: usize,
}

impl FrameMemory {
    /// Copy `data` into a freshly allocated, sealed memory file.
    pub fn from_bytes(data: &[u8]) -> io::Result<Self> {
        if data.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload is empty",
            ));
        }

        let fd = create_memfd(data.len())?;
        let mut file = File::from(fd);
        file.write_all(data)?;
        let fd = OwnedFd::from(file);

        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, FRAME_SEALS) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            len: data.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn identity(&self) -> io::Result<MemoryIdentity> {
        identity(self.fd.as_fd())
    }

    /// Map the payload read-only.
    pub fn map(&self) -> io::Result<MappedRegion> {
        MappedRegion::map(self.fd.as_fd(), self.len)
    }
}

impl AsFd for FrameMemory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Create an anonymous memory file of `size` bytes.
fn create_memfd(size: usize) -> io::Result<OwnedFd> {
    let name = CString::new(MEMFD_NAME).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let fd = unsafe {
        libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

fn fstat(fd: BorrowedFd<'_>) -> io::Result<libc::stat> {
    let stat = unsafe {
        let mut stat: libc::stat = std::mem::zeroed();
        if libc::fstat(fd.as_raw_fd(), &mut stat) < 0 {
            return Err(io::Error::last_os_error());
        }
        stat
    };
    Ok(stat)
}

/// Size in bytes of the file behind `fd`.
pub fn file_size(fd: BorrowedFd<'_>) -> io::Result<u64> {
    Ok(fstat(fd)?.st_size as u64)
}

/// Backing identity of the file behind `fd`.
pub fn identity(fd: BorrowedFd<'_>) -> io::Result<MemoryIdentity> {
    let stat = fstat(fd)?;
    Ok(MemoryIdentity {
        dev: stat.st_dev as u64,
        ino: stat.st_ino as u64,
    })
}

/// Read-only shared mapping of a frame payload, unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is PROT_READ and the file is sealed, so shared access is sound.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    pub fn map(fd: BorrowedFd<'_>, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty payload",
            ));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}
