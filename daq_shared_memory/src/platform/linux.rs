//! Linux-specific arena mapping

use memmap2::{MmapMut, MmapOptions};

/// Arena mapping configuration
#[derive(Debug, Clone, Copy)]
pub struct ArenaMemoryConfig {
    /// Pre-fault pages at map time (MAP_POPULATE)
    pub populate: bool,
    /// Lock pages into RAM (mlock) so the real-time writer never faults
    pub locked: bool,
}

impl Default for ArenaMemoryConfig {
    fn default() -> Self {
        Self {
            populate: true,
            locked: false,
        }
    }
}

/// Map a zeroed anonymous region of `size` bytes.
pub fn map_arena(size: usize, config: &ArenaMemoryConfig) -> std::io::Result<MmapMut> {
    let mut options = MmapOptions::new();
    options.len(size);

    if config.populate {
        options.populate();
    }

    let mmap = options.map_anon()?;

    if config.locked {
        lock_region(mmap.as_ptr(), mmap.len())?;
    }

    Ok(mmap)
}

/// Lock a mapped region into RAM
#[cfg(target_os = "linux")]
fn lock_region(addr: *const u8, size: usize) -> std::io::Result<()> {
    let result = unsafe { libc::mlock(addr as *const libc::c_void, size) };

    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_region(_addr: *const u8, _size: usize) -> std::io::Result<()> {
    Ok(()) // No-op on non-Linux
}
