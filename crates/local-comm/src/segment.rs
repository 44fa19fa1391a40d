//! Named POSIX shared memory segments.
//!
//! A [`Segment`] wraps `shm_open` + `mmap`. Two operations end its life and
//! they are deliberately separate:
//!
//! - [`Segment::close`] unmaps the local view. Either side may do it, and it
//!   is idempotent.
//! - [`Segment::destroy`] unlinks the name, freeing the block once every
//!   mapping is gone. It must happen exactly once across both processes.
//!
//! Who destroys is decided by the [`Ownership`] flag carried on each handle.
//! `destroy` on a [`Ownership::Borrower`] handle is a no-op, so the handoff
//! protocol is expressed by creating or attaching with the right flag and by
//! [`Segment::release_ownership`] once the peer has taken over.
//!
//! Dropping a handle closes it and, if it still owns an undestroyed block,
//! destroys it.

// OS boundary: shm_open/mmap/munmap. Every unsafe block carries a SAFETY note.
#![allow(unsafe_code)]

use crate::{LocalCommError, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest name accepted, leaving room for the leading `/` under NAME_MAX.
const MAX_NAME_LEN: usize = 250;

/// Which handle is responsible for destroying the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// `destroy` unlinks the block.
    Owner,
    /// `destroy` is a no-op; another handle (maybe in another process) owns it.
    Borrower,
}

#[derive(Debug)]
struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

/// Handle to a named shared memory block.
#[derive(Debug)]
pub struct Segment {
    name: String,
    size: usize,
    mapping: Option<Mapping>,
    ownership: Ownership,
    destroyed: bool,
}

// SAFETY: the mapping is plain bytes owned by this handle. Mutation goes
// through `&mut self`; shared access only copies out of the region.
unsafe impl Send for Segment {}
// SAFETY: see above; `&self` methods never write through the pointer.
unsafe impl Sync for Segment {}

fn os_name(name: &str) -> String {
    format!("/{}", name)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(['/', '\0']) {
        return Err(LocalCommError::Segment {
            name: name.to_string(),
            message: "invalid segment name".to_string(),
            source: None,
        });
    }
    Ok(())
}

fn map_shared<F: AsFd>(name: &str, fd: F, len: usize) -> Result<Mapping> {
    let length = NonZeroUsize::new(len).ok_or_else(|| LocalCommError::Segment {
        name: name.to_string(),
        message: "cannot map an empty segment".to_string(),
        source: None,
    })?;

    // SAFETY: fresh mapping chosen by the kernel (addr = None) over a shared
    // memory object at least `len` bytes long; nothing else aliases it in
    // this process.
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| LocalCommError::segment(name, "mmap failed", e))?;

    Ok(Mapping { ptr, len })
}

impl Segment {
    /// Create a new uniquely named segment able to hold `size` bytes.
    ///
    /// The returned handle is the [`Ownership::Owner`]. Zero-sized segments
    /// are backed by one byte so they can still be mapped.
    pub fn create(prefix: &str, size: usize) -> Result<Self> {
        let name = format!("{}{}", prefix, Uuid::new_v4().simple());
        validate_name(&name)?;
        let path = os_name(&name);

        let fd = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| LocalCommError::segment(&name, "shm_open(create) failed", e))?;

        let capacity = size.max(1);
        let mapped = nix::libc::off_t::try_from(capacity)
            .map_err(|_| LocalCommError::Segment {
                name: name.clone(),
                message: format!("size {} too large", size),
                source: None,
            })
            .and_then(|len| {
                ftruncate(&fd, len)
                    .map_err(|e| LocalCommError::segment(&name, "ftruncate failed", e))
            })
            .and_then(|_| map_shared(&name, &fd, capacity));

        let mapping = match mapped {
            Ok(mapping) => mapping,
            Err(e) => {
                if let Err(unlink_err) = shm_unlink(path.as_str()) {
                    warn!("Failed to unlink half-created segment {}: {}", name, unlink_err);
                }
                return Err(e);
            }
        };

        debug!("Created segment {} ({} bytes)", name, size);

        Ok(Self {
            name,
            size,
            mapping: Some(mapping),
            ownership: Ownership::Owner,
            destroyed: false,
        })
    }

    /// Map an existing segment by name.
    ///
    /// Fails with [`LocalCommError::SegmentNotFound`] if no such block exists.
    pub fn attach(name: &str, ownership: Ownership) -> Result<Self> {
        validate_name(name)?;

        let fd = match shm_open(os_name(name).as_str(), OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => {
                return Err(LocalCommError::SegmentNotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(LocalCommError::segment(name, "shm_open(attach) failed", e)),
        };

        let file = File::from(fd);
        let len = usize::try_from(file.metadata()?.len()).map_err(|_| LocalCommError::Segment {
            name: name.to_string(),
            message: "segment larger than address space".to_string(),
            source: None,
        })?;
        let mapping = map_shared(name, &file, len)?;

        debug!("Attached segment {} ({} bytes, {:?})", name, len, ownership);

        Ok(Self {
            name: name.to_string(),
            size: len,
            mapping: Some(mapping),
            ownership,
            destroyed: false,
        })
    }

    /// The segment's name as carried in control messages.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Logical size: the requested size for created segments, the mapped
    /// length for attached ones.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current ownership of the block.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Whether the local mapping is still open.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Hand destruction over to the peer. Later `destroy` calls are no-ops.
    pub fn release_ownership(&mut self) {
        self.ownership = Ownership::Borrower;
    }

    fn mapping(&self) -> Result<&Mapping> {
        self.mapping.as_ref().ok_or_else(|| LocalCommError::Segment {
            name: self.name.clone(),
            message: "segment is closed".to_string(),
            source: None,
        })
    }

    /// Copy `data` to the start of the segment.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mapping = self.mapping()?;
        if data.len() > mapping.len {
            return Err(LocalCommError::Segment {
                name: self.name.clone(),
                message: format!("write of {} bytes exceeds {} mapped", data.len(), mapping.len),
                source: None,
            });
        }
        // SAFETY: bounds checked above; the source is a Rust slice and cannot
        // overlap a fresh mmap region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapping.ptr.as_ptr().cast::<u8>(),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy the first `len` bytes out of the segment.
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        let mapping = self.mapping()?;
        if len > mapping.len {
            return Err(LocalCommError::Segment {
                name: self.name.clone(),
                message: format!("read of {} bytes exceeds {} mapped", len, mapping.len),
                source: None,
            });
        }
        let mut out = vec![0u8; len];
        // SAFETY: bounds checked above; `out` is a distinct heap allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(mapping.ptr.as_ptr().cast::<u8>(), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    /// Release the local mapping without freeing the block.
    pub fn close(&mut self) {
        if let Some(mapping) = self.mapping.take() {
            // SAFETY: `ptr`/`len` came from a successful mmap and the mapping
            // was just taken out of `self`, so it is unmapped exactly once and
            // no slice into it outlives this call.
            if let Err(e) = unsafe { munmap(mapping.ptr, mapping.len) } {
                warn!("munmap of segment {} failed: {}", self.name, e);
            }
        }
    }

    /// Free the block if this handle owns it.
    ///
    /// A no-op for borrowers and for blocks already destroyed through this
    /// handle. A block that has vanished already is logged, not an error.
    pub fn destroy(&mut self) -> Result<()> {
        if self.ownership == Ownership::Borrower || self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        match shm_unlink(os_name(&self.name).as_str()) {
            Ok(()) => {
                debug!("Destroyed segment {}", self.name);
                Ok(())
            }
            Err(Errno::ENOENT) => {
                warn!("Segment {} was already gone at destroy", self.name);
                Ok(())
            }
            Err(e) => Err(LocalCommError::segment(&self.name, "shm_unlink failed", e)),
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.close();
        if let Err(e) = self.destroy() {
            warn!("Failed to destroy segment on drop: {}", e);
        }
    }
}
