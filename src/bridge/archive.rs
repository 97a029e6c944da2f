//! Geo-database archive extraction
//!
//! Archives are gzip-compressed tarballs. Every `.mmdb` and `.csv` member is
//! written into the output directory under its bare file name, so nested or
//! `../` paths inside the archive never escape the output directory. Bare
//! `.mmdb` and `.csv` downloads are taken as they are.

use crate::bridge::error::ExtractionError;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::Archive;

/// Gzip magic number
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Database files found in an extracted archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedDatabase {
    /// MaxMind `.mmdb` files; at least one of the two is present
    MaxMind {
        country: Option<PathBuf>,
        asn: Option<PathBuf>,
    },
    /// CSV network table
    PrefixTable(PathBuf),
}

/// Archive loader for the downloaded geo-database
pub struct ArchiveLoader;

impl ArchiveLoader {
    /// Extract the archive into `output_dir` and locate the database files
    pub fn extract<P, Q>(archive_path: P, output_dir: Q) -> Result<ExtractedDatabase, ExtractionError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let archive_path = archive_path.as_ref();
        let extracted = Self::unpack(archive_path, output_dir.as_ref())?;
        Self::classify(&extracted).ok_or_else(|| ExtractionError::MissingDatabase(archive_path.to_path_buf()))
    }

    /// Gather database files from several downloads into `output_dir`
    ///
    /// A source named `*.mmdb` or `*.csv` is a database file in its own right
    /// and is copied as is; anything else is treated as a tar.gz archive.
    pub fn extract_all<P, Q>(sources: &[P], output_dir: Q) -> Result<ExtractedDatabase, ExtractionError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let output_dir = output_dir.as_ref();
        let mut extracted = Vec::new();

        for source in sources {
            let source = source.as_ref();
            if is_database_file(source) {
                extracted.push(Self::copy_database_file(source, output_dir)?);
            } else {
                extracted.extend(Self::unpack(source, output_dir)?);
            }
        }

        Self::classify(&extracted).ok_or_else(|| {
            let first = sources.first().map(|p| p.as_ref().to_path_buf()).unwrap_or_default();
            ExtractionError::MissingDatabase(first)
        })
    }

    fn copy_database_file(source: &Path, output_dir: &Path) -> Result<PathBuf, ExtractionError> {
        let io_error = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ExtractionError::Io { path, source }
        };

        let metadata = fs::metadata(source).map_err(io_error(source))?;
        if metadata.len() == 0 {
            return Err(ExtractionError::Empty(source.to_path_buf()));
        }

        fs::create_dir_all(output_dir).map_err(io_error(output_dir))?;
        let Some(file_name) = source.file_name() else {
            return Err(ExtractionError::MissingDatabase(source.to_path_buf()));
        };
        let destination = output_dir.join(file_name);
        fs::copy(source, &destination).map_err(io_error(&destination))?;
        log::info!("Using database file {}", destination.display());
        Ok(destination)
    }

    /// Unpack the `.mmdb` and `.csv` members of a tar.gz archive
    fn unpack(archive_path: &Path, output_dir: &Path) -> Result<Vec<PathBuf>, ExtractionError> {
        Self::validate(archive_path)?;

        fs::create_dir_all(output_dir).map_err(|source| ExtractionError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let file = File::open(archive_path).map_err(|source| ExtractionError::Io {
            path: archive_path.to_path_buf(),
            source,
        })?;
        let corrupt = |source| ExtractionError::Corrupt {
            path: archive_path.to_path_buf(),
            source,
        };

        let mut archive = Archive::new(GzDecoder::new(file));
        let mut extracted = Vec::new();

        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let path = entry.path().map_err(corrupt)?;
            let Some(file_name) = path.file_name().map(|n| n.to_os_string()) else {
                continue;
            };
            if !is_database_file(Path::new(&file_name)) {
                continue;
            }

            let destination = output_dir.join(&file_name);
            entry.unpack(&destination).map_err(corrupt)?;
            log::info!(
                "Extracted {} from {}",
                destination.display(),
                archive_path.display()
            );
            extracted.push(destination);
        }

        Ok(extracted)
    }

    /// Reject empty files and anything that is not gzip before decoding
    fn validate(archive_path: &Path) -> Result<(), ExtractionError> {
        let io_error = |source| ExtractionError::Io {
            path: archive_path.to_path_buf(),
            source,
        };

        let metadata = fs::metadata(archive_path).map_err(io_error)?;
        if metadata.len() == 0 {
            return Err(ExtractionError::Empty(archive_path.to_path_buf()));
        }

        let mut magic = [0u8; 2];
        File::open(archive_path)
            .and_then(|mut f| f.read_exact(&mut magic))
            .map_err(io_error)?;
        if magic != GZIP_MAGIC {
            return Err(ExtractionError::UnsupportedFormat(archive_path.to_path_buf()));
        }

        Ok(())
    }

    /// Pick the database files out of the extracted set
    ///
    /// MaxMind files take precedence over a CSV table when both are present.
    /// Names are matched case-insensitively: `*asn*.mmdb` is the ASN database,
    /// `*country*.mmdb` or `*city*.mmdb` the country database.
    fn classify(files: &[PathBuf]) -> Option<ExtractedDatabase> {
        let lower_name = |path: &PathBuf| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default()
        };

        let mut country = None;
        let mut asn = None;
        let mut table = None;

        for path in files {
            let name = lower_name(path);
            if name.ends_with(".mmdb") {
                if name.contains("asn") {
                    asn.get_or_insert_with(|| path.clone());
                } else if name.contains("country") || name.contains("city") {
                    country.get_or_insert_with(|| path.clone());
                }
            } else if name.ends_with(".csv") {
                table.get_or_insert_with(|| path.clone());
            }
        }

        if country.is_some() || asn.is_some() {
            Some(ExtractedDatabase::MaxMind { country, asn })
        } else {
            table.map(ExtractedDatabase::PrefixTable)
        }
    }
}

fn is_database_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mmdb") || ext.eq_ignore_ascii_case("csv"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::Builder;

    /// Creates a tar.gz archive with the specified files
    pub(crate) fn create_test_tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut tar_builder = Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar_builder.append(&header, *content).unwrap();
        }
        let tar_bytes = tar_builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("geo.tar.gz");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_extract_maxmind_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            &create_test_tar_gz(&[
                ("GeoLite2_20240101/README.txt", b"readme"),
                ("GeoLite2_20240101/GeoLite2-Country.mmdb", b"country"),
                ("GeoLite2_20240101/GeoLite2-ASN.mmdb", b"asn"),
            ]),
        );
        let out = dir.path().join("db");

        let extracted = ArchiveLoader::extract(&archive, &out).unwrap();
        assert_eq!(
            extracted,
            ExtractedDatabase::MaxMind {
                country: Some(out.join("GeoLite2-Country.mmdb")),
                asn: Some(out.join("GeoLite2-ASN.mmdb")),
            }
        );
        assert_eq!(fs::read(out.join("GeoLite2-ASN.mmdb")).unwrap(), b"asn");
        assert!(!out.join("README.txt").exists());
    }

    #[test]
    fn test_extract_matches_names_case_insensitively() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            &create_test_tar_gz(&[("geolite2-asn.MMDB", b"asn"), ("GeoLite2-COUNTRY.mmdb", b"c")]),
        );
        let out = dir.path().join("db");

        match ArchiveLoader::extract(&archive, &out).unwrap() {
            ExtractedDatabase::MaxMind { country, asn } => {
                assert!(country.is_some());
                assert!(asn.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_extract_csv_table() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(
            dir.path(),
            &create_test_tar_gz(&[("networks.csv", b"network,country_code\n")]),
        );
        let out = dir.path().join("db");

        let extracted = ArchiveLoader::extract(&archive, &out).unwrap();
        assert_eq!(extracted, ExtractedDatabase::PrefixTable(out.join("networks.csv")));
    }

    #[test]
    fn test_extract_strips_traversal_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            // set_path refuses `..`, so write the raw name field
            let name = b"../../GeoLite2-ASN.mmdb";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_size(3);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, &b"asn"[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        let archive = write_archive(dir.path(), &encoder.finish().unwrap());
        let out = dir.path().join("nested").join("db");

        let extracted = ArchiveLoader::extract(&archive, &out).unwrap();
        assert_eq!(
            extracted,
            ExtractedDatabase::MaxMind {
                country: None,
                asn: Some(out.join("GeoLite2-ASN.mmdb")),
            }
        );
        assert!(!dir.path().join("GeoLite2-ASN.mmdb").exists());
    }

    #[test]
    fn test_extract_empty_archive_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), b"");
        let result = ArchiveLoader::extract(&archive, dir.path().join("db"));
        assert!(matches!(result, Err(ExtractionError::Empty(_))));
    }

    #[test]
    fn test_extract_rejects_non_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), b"PK\x03\x04 zip file");
        let result = ArchiveLoader::extract(&archive, dir.path().join("db"));
        assert!(matches!(result, Err(ExtractionError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_extract_corrupt_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), &[0x1f, 0x8b, 0x00, 0x01, 0x02, 0x03]);
        let result = ArchiveLoader::extract(&archive, dir.path().join("db"));
        assert!(matches!(result, Err(ExtractionError::Corrupt { .. })));
    }

    #[test]
    fn test_extract_archive_without_database() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), &create_test_tar_gz(&[("README.txt", b"readme")]));
        let result = ArchiveLoader::extract(&archive, dir.path().join("db"));
        assert!(matches!(result, Err(ExtractionError::MissingDatabase(_))));
    }

    #[test]
    fn test_extract_all_accepts_raw_mmdb_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let asn = dir.path().join("geo-0-GeoLite2-ASN.mmdb");
        let country = dir.path().join("geo-1-GeoLite2-Country.mmdb");
        fs::write(&asn, b"asn").unwrap();
        fs::write(&country, b"country").unwrap();
        let out = dir.path().join("db");

        let extracted = ArchiveLoader::extract_all(&[&asn, &country], &out).unwrap();
        assert_eq!(
            extracted,
            ExtractedDatabase::MaxMind {
                country: Some(out.join("geo-1-GeoLite2-Country.mmdb")),
                asn: Some(out.join("geo-0-GeoLite2-ASN.mmdb")),
            }
        );
        assert_eq!(fs::read(out.join("geo-0-GeoLite2-ASN.mmdb")).unwrap(), b"asn");
    }

    #[test]
    fn test_extract_all_mixes_archives_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), &create_test_tar_gz(&[("GeoLite2-ASN.mmdb", b"asn")]));
        let country = dir.path().join("GeoLite2-Country.mmdb");
        fs::write(&country, b"country").unwrap();
        let out = dir.path().join("db");

        match ArchiveLoader::extract_all(&[archive, country], &out).unwrap() {
            ExtractedDatabase::MaxMind { country, asn } => {
                assert_eq!(country, Some(out.join("GeoLite2-Country.mmdb")));
                assert_eq!(asn, Some(out.join("GeoLite2-ASN.mmdb")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_extract_all_rejects_empty_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let asn = dir.path().join("GeoLite2-ASN.mmdb");
        fs::write(&asn, b"").unwrap();

        let result = ArchiveLoader::extract_all(&[&asn], dir.path().join("db"));
        assert!(matches!(result, Err(ExtractionError::Empty(_))));
    }

    #[test]
    fn test_extract_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = ArchiveLoader::extract(dir.path().join("absent.tar.gz"), dir.path().join("db"));
        assert!(matches!(result, Err(ExtractionError::Io { .. })));
    }
}
