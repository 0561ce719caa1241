// Module loading system calls

use crate::decompress::{decompress, Compression};
use log::debug;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::ops::BitOr;
use std::path::Path;

/// Flags to finit_module(2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitFlags(u32);

impl InitFlags {
    /// Ignore symbol version hashes
    pub const IGNORE_MODVERSIONS: InitFlags = InitFlags(0x1);
    /// Ignore kernel version magic
    pub const IGNORE_VERMAGIC: InitFlags = InitFlags(0x2);

    pub const fn empty() -> Self {
        InitFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: InitFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for InitFlags {
    type Output = InitFlags;

    fn bitor(self, rhs: InitFlags) -> InitFlags {
        InitFlags(self.0 | rhs.0)
    }
}

/// Flags to delete_module(2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteFlags(u32);

impl DeleteFlags {
    /// Fail instead of waiting for the module to become unused
    pub const NONBLOCK: DeleteFlags = DeleteFlags(libc::O_NONBLOCK as u32);
    /// Force removal even if the module is in use
    pub const TRUNC: DeleteFlags = DeleteFlags(libc::O_TRUNC as u32);

    pub const fn empty() -> Self {
        DeleteFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: DeleteFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DeleteFlags {
    type Output = DeleteFlags;

    fn bitor(self, rhs: DeleteFlags) -> DeleteFlags {
        DeleteFlags(self.0 | rhs.0)
    }
}

/// Something that can put modules into (and take them out of) a kernel.
pub trait ModuleLoader {
    /// Load a module image already in memory (init_module(2))
    fn init(&mut self, image: &[u8], params: &str) -> io::Result<()>;

    /// Load a module from an open file (finit_module(2))
    fn finit(&mut self, file: &File, params: &str, flags: InitFlags) -> io::Result<()>;

    /// Unload a module by name (delete_module(2))
    fn delete(&mut self, name: &str, flags: DeleteFlags) -> io::Result<()>;

    /// Load the module file at `path`.
    ///
    /// Compressed modules are decompressed in memory and go through `init`.
    /// Everything else goes through `finit`, falling back to `init` when the
    /// kernel lacks finit_module(2) and no flags were requested.
    fn file_init(&mut self, path: &Path, params: &str, flags: InitFlags) -> io::Result<()> {
        let mut file = File::open(path)?;

        if let Some(compression) = Compression::from_path(path) {
            debug!("decompressing {} ({:?})", path.display(), compression);
            let image = decompress(compression, BufReader::new(file))?;
            return self.init(&image, params);
        }

        match self.finit(&file, params, flags) {
            Err(e) if e.raw_os_error() == Some(libc::ENOSYS) && flags.is_empty() => {
                debug!(
                    "finit_module unavailable, falling back to init_module for {}",
                    path.display()
                );
                let mut image = Vec::new();
                file.read_to_end(&mut image)?;
                self.init(&image, params)
            }
            other => other,
        }
    }
}

/// Loads modules into the running kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxLoader;

impl LinuxLoader {
    pub fn new() -> Self {
        LinuxLoader
    }
}

#[cfg(target_os = "linux")]
impl ModuleLoader for LinuxLoader {
    fn init(&mut self, image: &[u8], params: &str) -> io::Result<()> {
        let params = c_string(params)?;
        // SAFETY: both buffers outlive the call and the kernel copies them.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_init_module,
                image.as_ptr() as *const libc::c_void,
                image.len() as libc::c_ulong,
                params.as_ptr(),
            )
        };
        check(ret)
    }

    fn finit(&mut self, file: &File, params: &str, flags: InitFlags) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let params = c_string(params)?;
        // SAFETY: the descriptor stays open for the duration of the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_finit_module,
                file.as_raw_fd(),
                params.as_ptr(),
                flags.bits() as libc::c_int,
            )
        };
        check(ret)
    }

    fn delete(&mut self, name: &str, flags: DeleteFlags) -> io::Result<()> {
        let name = c_string(name)?;
        // SAFETY: `name` is a valid NUL-terminated string for the whole call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_delete_module,
                name.as_ptr(),
                flags.bits() as libc::c_uint,
            )
        };
        check(ret)
    }
}

#[cfg(not(target_os = "linux"))]
impl ModuleLoader for LinuxLoader {
    fn init(&mut self, _image: &[u8], _params: &str) -> io::Result<()> {
        Err(unsupported())
    }

    fn finit(&mut self, _file: &File, _params: &str, _flags: InitFlags) -> io::Result<()> {
        Err(unsupported())
    }

    fn delete(&mut self, _name: &str, _flags: DeleteFlags) -> io::Result<()> {
        Err(unsupported())
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "kernel modules are only supported on Linux",
    )
}

#[cfg(target_os = "linux")]
fn check(ret: libc::c_long) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn c_string(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
