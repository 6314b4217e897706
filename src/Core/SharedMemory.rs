// Ring memory backends.
// A backend is the "capability" a ring is bound over: a contiguous byte region plus
// the teardown that happens when it is dropped. Heap regions serve in-process peers;
// /dev/shm regions are mapped MAP_SHARED so a peer process can attach by name.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

/// Alignment every backend guarantees for the start of its region.
pub const REGION_ALIGN: usize = 128;

/// A region a ring can be bound over. Dropping it releases the region.
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Start of the region, aligned to at least [`REGION_ALIGN`].
    fn as_ptr(&self) -> *mut u8;

    fn size(&self) -> usize;

    fn raw_handle(&self) -> RawHandle;
}

/// What the region is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawHandle {
    Heap,
    /// Descriptor of the open /dev/shm object.
    Fd(i32),
}

/// Zero-initialised, 128-byte aligned heap region.
#[derive(Debug)]
pub struct HeapMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The region is plain bytes; all concurrent access goes through atomics or
// through disjoint producer/consumer byte ranges.
unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "HeapMemory::new(): size must be non-zero",
            ));
        }
        let layout = Layout::from_size_align(size, REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("Failed to allocate {size} bytes of ring memory"),
            )
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl SharedMemoryBackend for HeapMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.layout.size()
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Heap
    }
}

/// Create the /dev/shm object `name` (replacing a stale one) and map `size` zeroed bytes.
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Map the /dev/shm object a peer created, refusing one smaller than `min_size`.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(name: &str, min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(name, min_size)?))
}

/// Remove the /dev/shm entry for `name`. Existing mappings stay valid.
#[cfg(target_os = "linux")]
pub fn unlink_shared_memory(name: &str) -> io::Result<()> {
    std::fs::remove_file(shm_path(name))
}

// Cross-process rings need /dev/shm; elsewhere only `Backing::Heap` works.
#[cfg(not(target_os = "linux"))]
fn unsupported<T>() -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "named ring memory needs /dev/shm",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: &str) -> io::Result<Box<dyn SharedMemoryBackend>> {
    unsupported()
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_name: &str, _min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    unsupported()
}

#[cfg(not(target_os = "linux"))]
pub fn unlink_shared_memory(_name: &str) -> io::Result<()> {
    unsupported()
}

#[cfg(target_os = "linux")]
fn shm_path(name: &str) -> String {
    format!("/dev/shm/{}", name)
}

#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: i32,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create (or truncate) a region in /dev/shm and map it.
    pub fn create(size: usize, name: &str) -> io::Result<Self> {
        use std::fs::OpenOptions;
        use std::os::fd::AsRawFd;
        use std::os::unix::fs::OpenOptionsExt;

        let path = shm_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                io::Error::new(e.kind(), format!("creating ring memory {path}: {e}"))
            })?;

        // Set size; the new pages read as zero.
        if unsafe { libc::ftruncate(file.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map(file, size)
    }

    /// Map an existing /dev/shm region, checking it is at least `min_size` bytes.
    pub fn attach(name: &str, min_size: usize) -> io::Result<Self> {
        use std::fs::OpenOptions;

        let path = shm_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                io::Error::new(e.kind(), format!("opening ring memory {path}: {e}"))
            })?;

        let size = file.metadata()?.len() as usize;
        if size < min_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ring memory {path} is {size} bytes, need {min_size}"),
            ));
        }

        Self::map(file, size)
    }

    fn map(file: std::fs::File, size: usize) -> io::Result<Self> {
        use std::os::fd::IntoRawFd;

        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty ring memory"));
        }
        let fd = file.into_raw_fd();

        // mmap hands back page-aligned memory, which satisfies REGION_ALIGN.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let Some(ptr) = NonNull::new(ptr as *mut u8) else {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(io::ErrorKind::Other, "mmap returned null"));
        };
        Ok(Self { ptr, size, fd })
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd)
    }
}
