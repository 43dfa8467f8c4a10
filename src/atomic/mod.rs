// Atomic file writes: temp file in the target directory, then rename.

use crate::error::Result;
use std::io::Write;
use std::path::Path;

/// Write `bytes` to `path` so that readers never observe a partial write.
///
/// The temp file is created in the same directory as the target, which keeps
/// the final rename on one filesystem. On any failure before the rename the
/// temp file is cleaned up and the target is untouched. Parent directories
/// are created as needed.
pub fn write(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
