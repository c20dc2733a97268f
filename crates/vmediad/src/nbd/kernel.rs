//! Thin wrappers around the Linux NBD driver ioctls.

use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use libc::{c_int, c_ulong};
use nix::errno::Errno;
use nix::{ioctl_none_bad, ioctl_write_int_bad, request_code_none};
use tracing::debug;

use vmedia_proto::error::{VmError, VmResult};

const NBD_IOCTL: u8 = 0xab;

ioctl_write_int_bad!(nbd_set_sock, request_code_none!(NBD_IOCTL, 0));
ioctl_write_int_bad!(nbd_set_blksize, request_code_none!(NBD_IOCTL, 1));
ioctl_none_bad!(nbd_do_it, request_code_none!(NBD_IOCTL, 3));
ioctl_none_bad!(nbd_clear_sock, request_code_none!(NBD_IOCTL, 4));
ioctl_none_bad!(nbd_clear_que, request_code_none!(NBD_IOCTL, 5));
ioctl_none_bad!(nbd_disconnect, request_code_none!(NBD_IOCTL, 8));
ioctl_write_int_bad!(nbd_set_flags, request_code_none!(NBD_IOCTL, 10));

/// NBD_SET_SIZE takes an unsigned long; the int-sized wrappers would
/// truncate images past 2 GiB.
unsafe fn nbd_set_size(fd: RawFd, bytes: c_ulong) -> nix::Result<c_int> {
    Errno::result(libc::ioctl(fd, request_code_none!(NBD_IOCTL, 2) as _, bytes))
}

/// An open `/dev/nbdN` node.
#[derive(Debug)]
pub struct NbdDevice {
    path: PathBuf,
    file: File,
}

impl NbdDevice {
    /// Open the device node. Fails with `NoDevice` if it does not exist.
    pub fn open(path: &Path) -> VmResult<Self> {
        if !path.exists() {
            return Err(VmError::NoDevice);
        }
        let file = File::open(path)
            .map_err(|e| VmError::Io(format!("failed to open {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Hand `sock` to the driver and size the device for the export.
    pub fn configure(&self, sock: RawFd, size: u64, block_size: u32, flags: u16) -> VmResult<()> {
        let fd = self.fd();
        debug!(
            "configuring {}: size={}, block_size={}, flags={:#x}",
            self.path.display(),
            size,
            block_size,
            flags
        );
        // SAFETY: fd is an open NBD device node owned by self
        unsafe {
            // A previous attach may have left a socket behind
            let _ = nbd_clear_sock(fd);
            nbd_set_blksize(fd, block_size as c_int).map_err(ioctl_err("NBD_SET_BLKSIZE"))?;
            nbd_set_size(fd, size as c_ulong).map_err(ioctl_err("NBD_SET_SIZE"))?;
            // Not every kernel supports flags; best effort
            let _ = nbd_set_flags(fd, flags as c_int);
            nbd_set_sock(fd, sock).map_err(ioctl_err("NBD_SET_SOCK"))?;
        }
        Ok(())
    }

    /// Serve requests until the device is disconnected. Blocks the calling thread.
    pub fn do_it(&self) -> VmResult<()> {
        let fd = self.fd();
        // SAFETY: see configure
        let result = unsafe { nbd_do_it(fd) };
        unsafe {
            let _ = nbd_clear_sock(fd);
            let _ = nbd_clear_que(fd);
        }
        result.map(|_| ()).map_err(ioctl_err("NBD_DO_IT"))
    }

    /// Ask the driver to detach from its socket.
    pub fn disconnect(&self) -> VmResult<()> {
        // SAFETY: see configure
        unsafe { nbd_disconnect(self.fd()) }
            .map(|_| ())
            .map_err(ioctl_err("NBD_DISCONNECT"))
    }
}

fn ioctl_err(name: &'static str) -> impl Fn(Errno) -> VmError {
    move |errno| VmError::Io(format!("{} failed: {}", name, errno))
}
