//! ConfigFS and sysfs file operations for USB gadgets

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// ConfigFS base path for USB gadgets
pub const CONFIGFS_PATH: &str = "/sys/kernel/config/usb_gadget";

/// Sysfs class directory listing USB Device Controllers
pub const UDC_CLASS_PATH: &str = "/sys/class/udc";

/// Find the USB Device Controller to bind gadgets to
///
/// Hidden entries are skipped; when several controllers exist the first in
/// name order is used so the choice is stable across restarts.
pub fn find_udc(udc_class_path: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(udc_class_path)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names.into_iter().next()
}

/// Path of a gadget's UDC binding file
pub fn udc_file(configfs_path: &Path, gadget: &str) -> PathBuf {
    configfs_path.join(gadget).join("UDC")
}

/// Write string content to a sysfs/configfs attribute
///
/// Sysfs attributes must receive the whole value in a single write()
/// syscall, so the newline-terminated buffer is built before writing.
/// The file is opened without O_TRUNC, which special files may reject.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| AppError::Usb(format!("Failed to open {}: {}", path.display(), e)))?;

    let data: std::borrow::Cow<[u8]> = if content.ends_with('\n') {
        content.as_bytes().into()
    } else {
        let mut buf = content.as_bytes().to_vec();
        buf.push(b'\n');
        buf.into()
    };

    file.write_all(&data)
        .map_err(|e| AppError::Usb(format!("Failed to write to {}: {}", path.display(), e)))?;

    file.flush()
        .map_err(|e| AppError::Usb(format!("Failed to flush {}: {}", path.display(), e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_find_udc_skips_hidden_and_sorts() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::create_dir(dir.path().join("musb-hdrc.0")).unwrap();
        fs::create_dir(dir.path().join("20980000.usb")).unwrap();

        assert_eq!(find_udc(dir.path()).as_deref(), Some("20980000.usb"));
    }

    #[test]
    fn test_find_udc_missing_dir() {
        assert!(find_udc(Path::new("/nonexistent/udc")).is_none());
    }

    #[test]
    fn test_write_file_appends_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("UDC");
        fs::write(&path, "").unwrap();

        write_file(&path, "20980000.usb").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "20980000.usb\n");
    }

    #[test]
    fn test_write_file_requires_existing_attribute() {
        let dir = tempdir().unwrap();
        assert!(write_file(&dir.path().join("missing/UDC"), "udc").is_err());
    }
}
