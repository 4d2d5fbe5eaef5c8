use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` reservations are aligned to this value (typically 64KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwAllocationGranularity as usize {
            0 => 65536,
            gran => gran,
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Reserves `len` bytes, committing them too unless `reserve_only`.
    pub unsafe fn map_anon(len: usize, reserve_only: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let _ = reserve_only;
            let layout = Layout::from_size_align(len, allocation_granularity())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            let kind = if reserve_only {
                MEM_RESERVE
            } else {
                MEM_COMMIT | MEM_RESERVE
            };
            let ptr = VirtualAlloc(ptr::null(), len, kind, PAGE_READWRITE);
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = (offset, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = self.ptr.cast::<u8>().add(offset).cast::<std::ffi::c_void>();
            if VirtualAlloc(addr, len, MEM_COMMIT, PAGE_READWRITE).is_null() {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            ptr::write_bytes(self.ptr.cast::<u8>().add(offset), 0, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = self.ptr.cast::<u8>().add(offset).cast::<std::ffi::c_void>();
            if VirtualFree(addr, len, MEM_DECOMMIT) == 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, allocation_granularity()) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}
