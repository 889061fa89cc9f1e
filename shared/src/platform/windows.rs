//! Named file-mapping plumbing for the shared segment.
//!
//! The mapping is page-file backed and exactly `size_of::<ShmLayout>()`
//! bytes. Names are UTF-8 everywhere in this codebase; they are widened
//! only here, at the OS boundary.

use std::io;
use std::ptr::{self, NonNull};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

use crate::errors::SegmentError;
use crate::layout::ShmLayout;

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// RAII pair of section handle and mapped view. Unmap and close run in
/// reverse order of acquisition; drop is idempotent by construction.
pub struct MappedSection {
    handle: HANDLE,
    view: NonNull<u8>,
}

unsafe impl Send for MappedSection {}
unsafe impl Sync for MappedSection {}

impl MappedSection {
    /// Creates (or opens, if the name collides) the mapping and maps a full
    /// read/write view. The second return value is the OS "already exists"
    /// indicator observed at creation time.
    pub fn create(name: &str) -> Result<(Self, bool), SegmentError> {
        let wide = to_wide(name);
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                ptr::null(),
                PAGE_READWRITE,
                0,
                size_of::<ShmLayout>() as u32,
                wide.as_ptr(),
            )
        };
        // Must be read before any other call can overwrite the thread error.
        let already_existed = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
        if handle.is_null() {
            return Err(SegmentError::Create {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        let section = Self::map_view(handle, name)?;
        log::debug!("mapped section `{name}` (already_existed={already_existed})");
        Ok((section, already_existed))
    }

    /// Opens an existing mapping by name; `NotFound` lets callers poll
    /// while the producer starts up.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        let wide = to_wide(name);
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide.as_ptr()) };
        if handle.is_null() {
            return Err(SegmentError::NotFound {
                name: name.to_owned(),
            });
        }
        Self::map_view(handle, name)
    }

    fn map_view(handle: HANDLE, name: &str) -> Result<Self, SegmentError> {
        // Zero length maps the entire section.
        let view_addr: MEMORY_MAPPED_VIEW_ADDRESS =
            unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0) };
        if view_addr.Value.is_null() {
            let err = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(SegmentError::Map {
                name: name.to_owned(),
                source: err,
            });
        }
        // SAFETY: non-NULL checked above.
        let view = unsafe { NonNull::new_unchecked(view_addr.Value.cast::<u8>()) };
        Ok(Self { handle, view })
    }

    pub fn base(&self) -> *mut u8 {
        self.view.as_ptr()
    }
}

impl Drop for MappedSection {
    fn drop(&mut self) {
        unsafe {
            let addr = MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.view.as_ptr().cast(),
            };
            UnmapViewOfFile(addr);
            CloseHandle(self.handle);
        }
        log::debug!("unmapped segment view and closed section handle");
    }
}
