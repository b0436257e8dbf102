//! The `NbdDevice` capability: the host-specific ioctl bridge to
//! `/dev/nbdX`, isolated here so everything above it stays portable.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

const NBD_SET_SOCK: libc::c_ulong = 0xab00;
const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
const NBD_DO_IT: libc::c_ulong = 0xab03;
const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
const NBD_DISCONNECT: libc::c_ulong = 0xab08;
const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;

const NBD_FLAG_HAS_FLAGS: libc::c_ulong = 1 << 0;
const NBD_FLAG_READ_ONLY: libc::c_ulong = 1 << 1;

/// An open NBD device node.
#[derive(Debug)]
pub struct NbdDevice {
    file: File,
}

impl NbdDevice {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(NbdDevice { file })
    }

    fn ioctl(&self, request: libc::c_ulong, arg: libc::c_ulong) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request, arg) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Hands the kernel its end of the request socket.
    pub fn set_socket(&self, fd: RawFd) -> io::Result<()> {
        self.ioctl(NBD_SET_SOCK, fd as libc::c_ulong)
    }

    pub fn set_block_size(&self, block_size: u64) -> io::Result<()> {
        self.ioctl(NBD_SET_BLKSIZE, block_size as libc::c_ulong)
    }

    pub fn set_block_count(&self, blocks: u64) -> io::Result<()> {
        self.ioctl(NBD_SET_SIZE_BLOCKS, blocks as libc::c_ulong)
    }

    pub fn set_read_only(&self) -> io::Result<()> {
        self.ioctl(NBD_SET_FLAGS, NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY)
    }

    /// Enters the kernel's blocking request loop. Returns only after
    /// a disconnect or a fatal device error.
    pub fn run(&self) -> io::Result<()> {
        self.ioctl(NBD_DO_IT, 0)
    }

    pub fn disconnect(&self) -> io::Result<()> {
        self.ioctl(NBD_DISCONNECT, 0)
    }

    pub fn clear_queue(&self) -> io::Result<()> {
        self.ioctl(NBD_CLEAR_QUE, 0)
    }

    pub fn clear_socket(&self) -> io::Result<()> {
        self.ioctl(NBD_CLEAR_SOCK, 0)
    }
}
