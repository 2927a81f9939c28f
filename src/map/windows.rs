//! Windows Implementation



use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    io,
    mem,
    os::windows::{fs::OpenOptionsExt, io::AsRawHandle},
    path::Path,
    ptr,
};

use log::warn;
use winapi::{
    shared::{
        minwindef::{DWORD, FALSE, LPCVOID},
        winerror::ERROR_ALREADY_EXISTS,
    },
    um::{
        errhandlingapi::GetLastError,
        handleapi::{CloseHandle, INVALID_HANDLE_VALUE},
        memoryapi::{
            FlushViewOfFile, MapViewOfFile, UnmapViewOfFile, VirtualQuery, FILE_MAP_READ,
            FILE_MAP_WRITE,
        },
        winbase::{CreateFileMappingA, OpenFileMappingA},
        winnt::{FILE_SHARE_READ, HANDLE, MEMORY_BASIC_INFORMATION, PAGE_READONLY, PAGE_READWRITE},
    },
};

use super::Backend;
use crate::{access::View, try_to_owned, Error, Result};



/// A raw memory mapping.
///
/// # Safety
/// - It will close itself when dropped.
// NOTES:
// - Fields drop in declaration order: the mapping object is closed before the file.
// - Named objects are reference counted by the system and disappear with their last handle, so
//   there is nothing to unlink.
pub struct Mapping {
    view: *mut u8,
    size: usize,
    writable: bool,
    backed: bool,
    name: Option<String>,
    mapping_handle: Handle,
    file: Option<File>,
}

// The mapping is exclusively owned, so it can move between threads.
unsafe impl Send for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Unmap the view.
        if unsafe { UnmapViewOfFile(self.view as LPCVOID) } == 0 {
            warn!("Failed to `UnmapViewOfFile`: {}", io::Error::last_os_error());
        }
    }
}

impl Backend for Mapping {
    fn map_file(path: &Path, writable: bool) -> Result<Self> {
        let (share, protect, access) = if writable {
            (0, PAGE_READWRITE, FILE_MAP_WRITE)
        } else {
            (FILE_SHARE_READ, PAGE_READONLY, FILE_MAP_READ)
        };

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .share_mode(share)
            .open(path)
            .map_err(|e| Error::os("CreateFileA", e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::os("GetFileSizeEx", e))?
            .len();
        let size = usize::try_from(len).map_err(|_| Error::MapTooLarge(len))?;
        if size == 0 {
            return Err(Error::MapSizeZero);
        }

        let mapping_handle = create_mapping(file.as_raw_handle().cast(), protect, 0, None)?;
        let view = map_view(&mapping_handle, access, 0)?;

        Ok(Self {
            view,
            size,
            writable,
            backed: true,
            name: None,
            mapping_handle,
            file: Some(file),
        })
    }

    fn map_anonymous(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MapSizeZero);
        }

        let mapping_handle = create_mapping(INVALID_HANDLE_VALUE, PAGE_READWRITE, size, None)?;
        let view = map_view(&mapping_handle, FILE_MAP_WRITE, 0)?;

        Ok(Self {
            view,
            size,
            writable: true,
            backed: false,
            name: None,
            mapping_handle,
            file: None,
        })
    }

    fn create_shared(name: &str, size: usize) -> Result<Self> {
        let c_name = object_name(name)?;
        let owned_name = try_to_owned(name)?;
        if size == 0 {
            return Err(Error::MapSizeZero);
        }

        let mapping_handle =
            create_mapping(INVALID_HANDLE_VALUE, PAGE_READWRITE, size, Some(&c_name))?;
        // Must be read before any other system call overwrites it.
        let attached = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;

        let (view, size) = if attached {
            // The existing object keeps its own size; map all of it.
            let view = map_view(&mapping_handle, FILE_MAP_WRITE, 0)?;
            let guard = ViewGuard(view);
            let size = region_size(view)?;
            (guard.release(), size)
        } else {
            (map_view(&mapping_handle, FILE_MAP_WRITE, size)?, size)
        };

        Ok(Self {
            view,
            size,
            writable: true,
            backed: false,
            name: Some(owned_name),
            mapping_handle,
            file: None,
        })
    }

    fn open_shared(name: &str) -> Result<Self> {
        let c_name = object_name(name)?;
        let owned_name = try_to_owned(name)?;

        let raw = unsafe { OpenFileMappingA(FILE_MAP_WRITE, FALSE, c_name.as_ptr()) };
        if raw.is_null() {
            return Err(Error::os("OpenFileMappingA", io::Error::last_os_error()));
        }
        let mapping_handle = Handle(raw);

        let view = map_view(&mapping_handle, FILE_MAP_WRITE, 0)?;
        let guard = ViewGuard(view);
        let size = region_size(view)?;

        Ok(Self {
            view: guard.release(),
            size,
            writable: true,
            backed: false,
            name: Some(owned_name),
            mapping_handle,
            file: None,
        })
    }

    fn view(&self) -> View {
        unsafe { View::new(self.view, self.size, self.writable) }
    }

    fn shared_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn flush(&self) -> Result<()> {
        if !self.backed {
            return Ok(());
        }
        if unsafe { FlushViewOfFile(self.view as LPCVOID, 0) } == 0 {
            return Err(Error::os("FlushViewOfFile", io::Error::last_os_error()));
        }
        Ok(())
    }
}



/// An owned kernel object handle, closed on drop.
struct Handle(HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        if unsafe { CloseHandle(self.0) } == 0 {
            warn!("Failed to `CloseHandle`: {}", io::Error::last_os_error());
        }
    }
}

/// Unmaps a view that hasn't been handed to a `Mapping` yet.
struct ViewGuard(*mut u8);

impl ViewGuard {
    fn release(self) -> *mut u8 {
        let view = self.0;
        mem::forget(self);
        view
    }
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        unsafe { UnmapViewOfFile(self.0 as LPCVOID) };
    }
}

fn object_name(name: &str) -> Result<CString> {
    match CString::new(name) {
        Ok(c_name) => Ok(c_name),
        Err(_) => Err(Error::InvalidName(try_to_owned(name)?)),
    }
}

fn high_order(size: u64) -> DWORD {
    (size >> 32) as DWORD
}

fn low_order(size: u64) -> DWORD {
    size as DWORD
}

/// Calls `CreateFileMappingA`. A `size` of 0 covers the whole file behind `file`.
fn create_mapping(
    file: HANDLE,
    protect: DWORD,
    size: usize,
    name: Option<&CString>,
) -> Result<Handle> {
    let size = size as u64;
    let name = name.map_or(ptr::null(), |n| n.as_ptr());

    let raw = unsafe {
        CreateFileMappingA(
            file,
            ptr::null_mut(),
            protect,
            high_order(size),
            low_order(size),
            name,
        )
    };
    if raw.is_null() {
        return Err(Error::os("CreateFileMappingA", io::Error::last_os_error()));
    }

    Ok(Handle(raw))
}

/// Calls `MapViewOfFile` from offset 0. A `size` of 0 maps the whole object.
fn map_view(mapping: &Handle, access: DWORD, size: usize) -> Result<*mut u8> {
    let view = unsafe { MapViewOfFile(mapping.0, access, 0, 0, size) };
    if view.is_null() {
        return Err(Error::os("MapViewOfFile", io::Error::last_os_error()));
    }
    Ok(view.cast())
}

/// The size the system reports for the region starting at `view`.
fn region_size(view: *mut u8) -> Result<usize> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
    let written = unsafe {
        VirtualQuery(
            view as LPCVOID,
            &mut info,
            mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 {
        return Err(Error::os("VirtualQuery", io::Error::last_os_error()));
    }
    Ok(info.RegionSize)
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_splits_into_words() {
        let size = 0x0000_0003_8000_0001u64;
        assert_eq!(high_order(size), 3);
        assert_eq!(low_order(size), 0x8000_0001);
    }

    #[test]
    fn names_pass_through() {
        assert_eq!(object_name("Local\\block").unwrap().as_bytes(), b"Local\\block");
        assert!(matches!(object_name("bl\0ck"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn shared_size_comes_from_the_system() {
        let name = format!("simmap_region_{}", std::process::id());
        let creator = Mapping::create_shared(&name, 100).unwrap();
        assert_eq!(creator.view().len(), 100);

        let opener = Mapping::open_shared(&name).unwrap();
        assert!(opener.view().len() >= 100);
    }

    #[test]
    fn pagefile_mappings_flush_trivially() {
        let map = Mapping::map_anonymous(4096).unwrap();
        assert!(map.flush().is_ok());
    }
}
