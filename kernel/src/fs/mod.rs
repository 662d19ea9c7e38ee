// Filesystem manager: named mount points, path splitting, and the listing
// endpoint that enumerates mounts. Concrete filesystems register themselves
// with attach_filesystem.

pub mod ktfs;

use core::cell::UnsafeCell;
use core::ptr;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::thread::Lock;
use crate::uio::{Uio, UioRef};

pub trait FileSystem: Send + Sync {
    fn open(&self, name: &str) -> Result<UioRef>;

    fn create(&self, _name: &str) -> Result<()> {
        Err(Error::NotSup)
    }

    fn delete(&self, _name: &str) -> Result<()> {
        Err(Error::NotSup)
    }

    fn flush(&self) {}
}

struct Mountpoint {
    name: String,
    fs: Arc<dyn FileSystem>,
}

static MOUNT_LOCK: Lock = Lock::new();
static mut MOUNTS: Vec<Mountpoint> = Vec::new();

pub static mut FSMGR_INITIALIZED: bool = false;

pub fn fsmgr_init() {
    unsafe { FSMGR_INITIALIZED = true };
}

#[allow(static_mut_refs)]
fn with_mounts<R>(f: impl FnOnce(&mut Vec<Mountpoint>) -> R) -> R {
    MOUNT_LOCK.acquire();
    let r = f(unsafe { &mut *ptr::addr_of_mut!(MOUNTS) });
    MOUNT_LOCK.release();
    r
}

/// Registers a filesystem under a mount point name.
pub fn attach_filesystem(name: &str, fs: Arc<dyn FileSystem>) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Inval);
    }
    with_mounts(|mounts| {
        if mounts.iter().any(|mp| mp.name == name) {
            return Err(Error::Exists);
        }
        mounts.push(Mountpoint {
            name: String::from(name),
            fs,
        });
        Ok(())
    })
}

fn getfs(mpname: &str) -> Result<Arc<dyn FileSystem>> {
    with_mounts(|mounts| {
        mounts
            .iter()
            .find(|mp| mp.name == mpname)
            .map(|mp| mp.fs.clone())
            .ok_or(Error::NoEnt)
    })
}

/// Opens mpname/flname. An empty mount point name opens the mount listing.
pub fn open_file(mpname: &str, flname: &str) -> Result<UioRef> {
    if mpname.is_empty() {
        return open_mount_listing();
    }
    getfs(mpname)?.open(flname)
}

pub fn create_file(mpname: &str, flname: &str) -> Result<()> {
    getfs(mpname)?.create(flname)
}

pub fn delete_file(mpname: &str, flname: &str) -> Result<()> {
    getfs(mpname)?.delete(flname)
}

pub fn fsmgr_flushall() {
    let all: Vec<Arc<dyn FileSystem>> =
        with_mounts(|mounts| mounts.iter().map(|mp| mp.fs.clone()).collect());
    for fs in all {
        fs.flush();
    }
}

/// Splits "mnt/name" (an optional leading slash is dropped) into its mount
/// point and file name parts.
pub fn parse_path(path: &str) -> Result<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return Err(Error::Inval);
    }
    let (mp, fl) = path.split_once('/').ok_or(Error::Inval)?;
    if mp.is_empty() || fl.is_empty() {
        return Err(Error::Inval);
    }
    Ok((mp, fl))
}

// One mount name per read call, EOF once the snapshot is exhausted.
struct MountListing {
    names: Vec<String>,
    next: UnsafeCell<usize>,
}

unsafe impl Sync for MountListing {}
unsafe impl Send for MountListing {}

fn open_mount_listing() -> Result<UioRef> {
    let names = with_mounts(|mounts| mounts.iter().map(|mp| mp.name.clone()).collect());
    Ok(Arc::new(MountListing {
        names,
        next: UnsafeCell::new(0),
    }))
}

impl Uio for MountListing {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let next = unsafe { &mut *self.next.get() };
        if *next >= self.names.len() || buf.is_empty() {
            return Ok(0);
        }
        let name = self.names[*next].as_bytes();
        *next += 1;
        let n = name.len().min(buf.len());
        buf[..n].copy_from_slice(&name[..n]);
        Ok(n)
    }
}

/// A filesystem with no files; open always fails.
pub struct NullFs;

impl FileSystem for NullFs {
    fn open(&self, _name: &str) -> Result<UioRef> {
        Err(Error::NoEnt)
    }
}

pub fn mount_nullfs(name: &str) -> Result<()> {
    attach_filesystem(name, Arc::new(NullFs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_splits_mount_and_name() {
        assert_eq!(parse_path("c/greet"), Ok(("c", "greet")));
        assert_eq!(parse_path("/dev/uart0"), Ok(("dev", "uart0")));
        // Only the first slash splits; the rest belongs to the name.
        assert_eq!(parse_path("c/a/b"), Ok(("c", "a/b")));
        assert_eq!(parse_path(""), Err(Error::Inval));
        assert_eq!(parse_path("/"), Err(Error::Inval));
        assert_eq!(parse_path("noslash"), Err(Error::Inval));
        assert_eq!(parse_path("c/"), Err(Error::Inval));
        assert_eq!(parse_path("/name"), Err(Error::Inval));
    }

    #[test]
    fn duplicate_mounts_are_rejected() {
        let _g = crate::test_guard();
        assert_eq!(mount_nullfs("nulltest"), Ok(()));
        assert_eq!(mount_nullfs("nulltest"), Err(Error::Exists));
        assert!(matches!(
            open_file("nulltest", "anything"),
            Err(Error::NoEnt)
        ));
        assert!(matches!(open_file("absent", "x"), Err(Error::NoEnt)));
    }

    #[test]
    fn listing_returns_one_name_per_read() {
        let _g = crate::test_guard();
        mount_nullfs("lsa").unwrap();
        mount_nullfs("lsb").unwrap();
        let ls = open_file("", "").unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 32];
        loop {
            let n = ls.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            seen.push(String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        assert!(seen.iter().any(|s| s == "lsa"));
        assert!(seen.iter().any(|s| s == "lsb"));
    }
}
