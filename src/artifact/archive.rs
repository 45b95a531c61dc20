use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

/// Unpacks `archive` into `dest`, creating it. Entries that would land
/// outside `dest` abort the extraction.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let mut zip = ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("{} is not a valid zip archive", archive.display()))?;

    fs::create_dir_all(dest)
        .with_context(|| format!("failed to create {}", dest.display()))?;

    let mut files = 0usize;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let rel = entry.enclosed_name().ok_or_else(|| {
            anyhow!("archive entry {:?} escapes the target directory", entry.name())
        })?;
        let out = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }

        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(
            File::create(&out).with_context(|| format!("failed to create {}", out.display()))?,
        );
        io::copy(&mut entry, &mut writer)
            .with_context(|| format!("failed to extract {}", out.display()))?;
        files += 1;
    }

    debug!(files, dest = %dest.display(), "archive extracted");
    Ok(files)
}

/// Zips every file under `src` into `archive`. Paths are stored relative
/// to `src`; top-level entries whose name matches `skip` are left out.
pub fn pack_dir(src: &Path, archive: &Path, skip: impl Fn(&str) -> bool) -> Result<usize> {
    let file = File::create(archive)
        .with_context(|| format!("failed to create {}", archive.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut files = 0usize;
    let mut stack: Vec<PathBuf> = vec![src.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = fs::read_dir(&dir)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let rel = path
                .strip_prefix(src)
                .map_err(|_| anyhow!("{} is outside {}", path.display(), src.display()))?;
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if dir == src && skip(&name) {
                continue;
            }

            if path.is_dir() {
                zip.add_directory(format!("{name}/"), options)?;
                stack.push(path);
            } else {
                zip.start_file(name, options)?;
                let mut reader = BufReader::new(File::open(&path)?);
                io::copy(&mut reader, &mut zip)?;
                files += 1;
            }
        }
    }

    zip.finish()?;
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_root;

    #[test]
    fn pack_then_extract_keeps_layout() {
        let root = temp_root("archive");
        let src = root.join("model");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("config.json"), b"{}").unwrap();
        fs::write(src.join("nested/weights.bin"), b"abc").unwrap();
        fs::create_dir_all(src.join("checkpoint-100")).unwrap();
        fs::write(src.join("checkpoint-100/model.safetensors"), b"x").unwrap();

        let zip_path = root.join("model.zip");
        let packed = pack_dir(&src, &zip_path, |name| name.starts_with("checkpoint-")).unwrap();
        assert_eq!(packed, 2);

        let out = root.join("out");
        let extracted = extract_zip(&zip_path, &out).unwrap();
        assert_eq!(extracted, 2);
        assert_eq!(fs::read(out.join("nested/weights.bin")).unwrap(), b"abc");
        assert!(!out.join("checkpoint-100").exists());

        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let root = temp_root("garbage");
        let path = root.join("model.zip");
        fs::write(&path, b"<html>quota exceeded</html>").unwrap();
        assert!(extract_zip(&path, &root.join("out")).is_err());
        fs::remove_dir_all(root).ok();
    }
}
