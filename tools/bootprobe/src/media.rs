//! Boot media assembly.
//!
//! The media is a plain directory that QEMU exposes to the guest as a FAT
//! drive (`fat:rw:<dir>`). It is wiped and rebuilt on every run so nothing
//! from a previous kernel survives.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{HarnessError, MediaError};
use crate::verbose::{dprintln, vprintln};

/// Where UEFI firmware looks for the default loader.
pub const LOADER_PATH: &str = "EFI/BOOT/BOOTX64.EFI";

/// Where the bootloader looks for the kernel.
pub const KERNEL_PATH: &str = "kernel.elf";

/// An assembled media tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootMedia {
    root: PathBuf,
}

impl BootMedia {
    /// Rebuild the media tree at `root` from a bootloader and kernel image.
    ///
    /// Both sources are checked before anything is deleted, so a missing
    /// input leaves the previous tree untouched.
    pub fn assemble(root: &Path, bootloader: &Path, kernel: &Path) -> Result<Self, HarnessError> {
        for (role, path) in [("bootloader", bootloader), ("kernel binary", kernel)] {
            if !path.is_file() {
                return Err(MediaError::MissingSource {
                    role,
                    path: path.to_path_buf(),
                }
                .into());
            }
        }

        dprintln!("Assembling boot media at {}", root.display());

        match fs::remove_dir_all(root) {
            Ok(()) => vprintln!("  removed previous media tree"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(root)(e).into()),
        }

        let media = Self {
            root: root.to_path_buf(),
        };
        let loader = media.loader_path();
        if let Some(dir) = loader.parent() {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        fs::copy(bootloader, &loader).map_err(io_err(&loader))?;
        fs::copy(kernel, media.kernel_path()).map_err(io_err(&media.kernel_path()))?;

        Ok(media)
    }

    /// An existing tree, without rebuilding it.
    #[cfg(test)]
    pub fn existing(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn loader_path(&self) -> PathBuf {
        self.root.join(LOADER_PATH)
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.root.join(KERNEL_PATH)
    }

    /// SHA-256 over every file's relative path and contents, in path order.
    pub fn digest(&self) -> io::Result<String> {
        let mut hasher = Sha256::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(io::Error::other)?;
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update([0u8]);
            hasher.update(fs::read(entry.path())?);
        }
        let hash = hasher.finalize();
        Ok(hash.iter().map(|b| format!("{b:02x}")).collect())
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MediaError {
    let path = path.to_path_buf();
    move |source| MediaError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("bootloader.efi"), b"MZ loader").unwrap();
            fs::write(dir.path().join("kernel"), b"\x7fELF kernel").unwrap();
            Self { dir }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn assemble(&self) -> Result<BootMedia, HarnessError> {
            BootMedia::assemble(&self.path("esp"), &self.path("bootloader.efi"), &self.path("kernel"))
        }
    }

    #[test]
    fn canonical_layout() {
        let fx = Fixture::new();
        let media = fx.assemble().unwrap();
        assert_eq!(fs::read(media.loader_path()).unwrap(), b"MZ loader");
        assert_eq!(fs::read(media.kernel_path()).unwrap(), b"\x7fELF kernel");
        assert!(fx.path("esp/EFI/BOOT/BOOTX64.EFI").is_file());
        assert!(fx.path("esp/kernel.elf").is_file());
    }

    #[test]
    fn rebuild_is_idempotent_and_drops_leftovers() {
        let fx = Fixture::new();
        let first = fx.assemble().unwrap().digest().unwrap();

        fs::write(fx.path("esp/stale.txt"), b"old run").unwrap();
        fs::create_dir_all(fx.path("esp/EFI/old")).unwrap();
        fs::write(fx.path("esp/EFI/old/junk"), b"junk").unwrap();

        let media = fx.assemble().unwrap();
        assert!(!fx.path("esp/stale.txt").exists());
        assert!(!fx.path("esp/EFI/old").exists());
        assert_eq!(media.digest().unwrap(), first);
    }

    #[test]
    fn digest_tracks_kernel_contents() {
        let fx = Fixture::new();
        let before = fx.assemble().unwrap().digest().unwrap();
        fs::write(fx.path("kernel"), b"\x7fELF kernel v2").unwrap();
        let after = fx.assemble().unwrap().digest().unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn missing_kernel_is_reported_and_media_untouched() {
        let fx = Fixture::new();
        fx.assemble().unwrap();
        fs::remove_file(fx.path("kernel")).unwrap();

        let err = fx.assemble().unwrap_err();
        assert!(matches!(
            err,
            HarnessError::MediaAssembly(MediaError::MissingSource { role: "kernel binary", .. })
        ));
        assert!(fx.path("esp/kernel.elf").is_file());
    }

    #[test]
    fn missing_bootloader_is_reported() {
        let fx = Fixture::new();
        fs::remove_file(fx.path("bootloader.efi")).unwrap();
        assert!(matches!(
            fx.assemble(),
            Err(HarnessError::MediaAssembly(MediaError::MissingSource { role: "bootloader", .. }))
        ));
    }
}
