//! Image archive extraction.
//!
//! An image is a tar archive in the image directory, optionally gzip
//! compressed. It is unpacked once into a read-only layer directory that
//! every container of that image shares.

use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};

use cellar_common::constants::IMAGE_ARCHIVE_EXTENSION;
use cellar_common::error::{CellarError, Result};

/// Returns the archive for `image` in `image_dir`, trying `.tar`, then
/// `.tar.gz` and `.tgz`.
#[must_use]
pub fn find_image_archive(image_dir: &Path, image: &str) -> Option<PathBuf> {
    [
        format!("{image}.{IMAGE_ARCHIVE_EXTENSION}"),
        format!("{image}.{IMAGE_ARCHIVE_EXTENSION}.gz"),
        format!("{image}.tgz"),
    ]
    .into_iter()
    .map(|name| image_dir.join(name))
    .find(|candidate| candidate.is_file())
}

/// Unpacks `archive` into `target`.
///
/// The archive is first unpacked into a sibling staging directory that
/// is renamed into place on success, so `target` never holds a partial
/// layer.
///
/// # Errors
///
/// Returns [`CellarError::Extraction`] if the archive cannot be opened or
/// unpacked, or the staging directory cannot be moved into place.
pub fn extract_layer(image: &str, archive: &Path, target: &Path) -> Result<()> {
    tracing::info!(
        image,
        archive = %archive.display(),
        target = %target.display(),
        "extracting image layer"
    );
    let extraction = |message: String| CellarError::Extraction {
        image: image.to_owned(),
        message,
    };

    let staging = staging_dir(target);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .map_err(|e| extraction(format!("clearing {}: {e}", staging.display())))?;
    }
    std::fs::create_dir_all(&staging)
        .map_err(|e| extraction(format!("creating {}: {e}", staging.display())))?;

    if let Err(e) = unpack(archive, &staging) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(extraction(e));
    }

    if let Err(e) = std::fs::rename(&staging, target) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(extraction(format!("moving layer into {}: {e}", target.display())));
    }
    tracing::info!(image, target = %target.display(), "image layer extracted");
    Ok(())
}

fn unpack(archive: &Path, target: &Path) -> std::result::Result<(), String> {
    let file = File::open(archive).map_err(|e| format!("opening {}: {e}", archive.display()))?;
    let result = if is_gzip_archive(archive) {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(target)
    } else {
        tar::Archive::new(file).unpack(target)
    };
    result.map_err(|e| format!("unpacking {}: {e}", archive.display()))
}

fn staging_dir(target: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    if let Some(file_name) = target.file_name() {
        name.push(file_name);
    }
    name.push(".partial");
    target.with_file_name(name)
}

/// Determines whether the archive is gzip-compressed based on extension.
fn is_gzip_archive(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar(path: &Path, name: &str, data: &[u8]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, data).unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn extract_plain_tar_creates_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("busybox.tar");
        write_tar(&archive, "bin/hello.txt", b"hello from layer");
        let target = dir.path().join("layers").join("busybox");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();

        extract_layer("busybox", &archive, &target).unwrap();
        let content = std::fs::read_to_string(target.join("bin/hello.txt")).unwrap();
        assert_eq!(content, "hello from layer");
        assert!(!staging_dir(&target).exists());
    }

    #[test]
    fn extract_gzip_tar_creates_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("alpine.tar.gz");
        let encoder = flate2::write::GzEncoder::new(
            File::create(&archive).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        let data = b"hello from gzipped layer";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "gz.txt", &data[..]).unwrap();
        let _ = builder.into_inner().unwrap().finish().unwrap();

        let target = dir.path().join("alpine");
        extract_layer("alpine", &archive, &target).unwrap();
        assert!(target.join("gz.txt").exists());
    }

    #[test]
    fn corrupt_archive_leaves_no_layer_behind() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.tar.gz");
        std::fs::write(&archive, b"definitely not gzip").unwrap();
        let target = dir.path().join("broken");

        let err = extract_layer("broken", &archive, &target).unwrap_err();
        assert!(matches!(err, CellarError::Extraction { ref image, .. } if image == "broken"));
        assert!(!target.exists());
        assert!(!staging_dir(&target).exists());
    }

    #[test]
    fn archive_lookup_prefers_plain_tar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.tgz"), b"").unwrap();
        assert_eq!(find_image_archive(dir.path(), "app"), Some(dir.path().join("app.tgz")));
        std::fs::write(dir.path().join("app.tar"), b"").unwrap();
        assert_eq!(find_image_archive(dir.path(), "app"), Some(dir.path().join("app.tar")));
        assert_eq!(find_image_archive(dir.path(), "other"), None);
    }
}
