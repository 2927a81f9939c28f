//! Unix Implementation



use std::{
    ffi::c_void,
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    os::fd::OwnedFd,
    path::Path,
    ptr::NonNull,
};

use log::warn;
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{
        mman::{
            mmap, mmap_anonymous, msync, munmap, shm_open, shm_unlink, MapFlags, MsFlags,
            ProtFlags,
        },
        stat::Mode,
    },
};

use super::Backend;
use crate::{access::View, try_to_owned, Error, Result};



/// A raw memory mapping.
///
/// # Safety
/// - It will close itself when dropped.
// NOTES:
// - See https://github.com/nix-rust/nix/pull/2000 for some more info on `nix` ops.
// - Fields drop in declaration order, so `file` is closed before `shm` is unlinked.
pub struct Mapping {
    addr: NonNull<c_void>,
    map_size: usize,
    writable: bool,
    /// Only file mappings keep their descriptor open.
    file: Option<File>,
    shm: Option<ShmName>,
}

// The mapping is exclusively owned, so it can move between threads.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Unmap memory.
        if let Err(e) = unsafe { munmap(self.addr, self.map_size) } {
            warn!("Failed to `munmap` memory map: {}", e);
        }
    }
}

impl Backend for Mapping {
    fn map_file(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| Error::os("open", e))?;
        let len = file.metadata().map_err(|e| Error::os("fstat", e))?.len();
        let map_size = usize::try_from(len).map_err(|_| Error::MapTooLarge(len))?;

        let addr = map_shared(&file, map_size, writable)?;

        Ok(Self {
            addr,
            map_size,
            writable,
            file: Some(file),
            shm: None,
        })
    }

    fn map_anonymous(size: usize) -> Result<Self> {
        let length = NonZeroUsize::new(size).ok_or(Error::MapSizeZero)?;
        let addr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| Error::os("mmap", e))?;

        Ok(Self {
            addr,
            map_size: size,
            writable: true,
            file: None,
            shm: None,
        })
    }

    fn create_shared(name: &str, size: usize) -> Result<Self> {
        let mut shm = ShmName::new(name)?;
        if size == 0 {
            return Err(Error::MapSizeZero);
        }

        let mode = Mode::from_bits_truncate(0o666);
        let fd = match shm_open(
            shm.name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            mode,
        ) {
            Ok(fd) => {
                // From here on a failure removes the object again.
                shm.unlink = true;
                fd
            }
            Err(Errno::EEXIST) => shm_open(shm.name.as_str(), OFlag::O_RDWR, mode)
                .map_err(|e| Error::os("shm_open", e))?,
            Err(e) => return Err(Error::os("shm_open", e)),
        };
        let file = File::from(fd);

        // An object someone else already sized keeps its size.
        let existing = file.metadata().map_err(|e| Error::os("fstat", e))?.len();
        let map_size = if existing == 0 {
            file.set_len(size as u64).map_err(|e| Error::os("ftruncate", e))?;
            size
        } else {
            usize::try_from(existing).map_err(|_| Error::MapTooLarge(existing))?
        };

        let addr = map_shared(&file, map_size, true)?;
        shm.unlink = true;

        Ok(Self {
            addr,
            map_size,
            writable: true,
            file: None,
            shm: Some(shm),
        })
    }

    fn open_shared(name: &str) -> Result<Self> {
        let mut shm = ShmName::new(name)?;

        let fd: OwnedFd = shm_open(shm.name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| Error::os("shm_open", e))?;
        let file = File::from(fd);
        let len = file.metadata().map_err(|e| Error::os("fstat", e))?.len();
        let map_size = usize::try_from(len).map_err(|_| Error::MapTooLarge(len))?;

        let addr = map_shared(&file, map_size, true)?;
        shm.unlink = true;

        Ok(Self {
            addr,
            map_size,
            writable: true,
            file: None,
            shm: Some(shm),
        })
    }

    fn view(&self) -> View {
        unsafe { View::new(self.addr.as_ptr().cast(), self.map_size, self.writable) }
    }

    fn shared_name(&self) -> Option<&str> {
        self.shm.as_ref().map(|shm| shm.name.as_str())
    }

    fn flush(&self) -> Result<()> {
        if self.file.is_none() && self.shm.is_none() {
            return Ok(());
        }
        unsafe { msync(self.addr, self.map_size, MsFlags::MS_SYNC) }
            .map_err(|e| Error::os("msync", e))
    }
}

/// Maps all `len` bytes of `file` with `MAP_SHARED`.
fn map_shared(file: &File, len: usize, writable: bool) -> Result<NonNull<c_void>> {
    let length = NonZeroUsize::new(len).ok_or(Error::MapSizeZero)?;
    let prot = if writable {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
    } else {
        ProtFlags::PROT_READ
    };

    unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, file, 0) }
        .map_err(|e| Error::os("mmap", e))
}



/// A POSIX shared memory object name, unlinked on drop once `unlink` is set.
struct ShmName {
    name: String,
    unlink: bool,
}

impl ShmName {
    /// `shm_open` names need a single leading slash.
    fn new(name: &str) -> Result<Self> {
        if name.contains('\0') {
            return Err(Error::InvalidName(try_to_owned(name)?));
        }

        let mut normalized = String::new();
        normalized.try_reserve_exact(name.len() + 1)?;
        if !name.starts_with('/') {
            normalized.push('/');
        }
        normalized.push_str(name);

        Ok(Self {
            name: normalized,
            unlink: false,
        })
    }
}

impl Drop for ShmName {
    fn drop(&mut self) {
        // Unlink shm.
        if self.unlink {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!("Failed to `shm_unlink` {}: {}", self.name, e);
            }
        }
    }
}
