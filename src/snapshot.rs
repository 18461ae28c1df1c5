use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const STORE_ENTRY: &str = "store/migration.sqlite3";
const MAPPING_PREFIX: &str = "mappings/";
pub const SNAPSHOT_FORMAT_V1: &str = "legacy-migration-snapshot-v1";

#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub format: String,
    pub entry_count: usize,
    pub mapping_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    pub format: String,
    pub mapping_files: Vec<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn write_entry(
    zip: &mut ZipWriter<File>,
    name: &str,
    bytes: &[u8],
    opts: FileOptions,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start entry {name}"))?;
    zip.write_all(bytes)
        .with_context(|| format!("failed to write entry {name}"))?;
    Ok(())
}

/// Mapping files currently in `mapping_dir`, sorted by name.
fn mapping_files(mapping_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !mapping_dir.is_dir() {
        return Ok(out);
    }
    for ent in std::fs::read_dir(mapping_dir)
        .with_context(|| format!("failed to list {}", mapping_dir.to_string_lossy()))?
    {
        let p = ent?.path();
        let is_mapping = p
            .file_name()
            .and_then(|s| s.to_str())
            .map(|n| n.ends_with("_mapping.json"))
            .unwrap_or(false);
        if p.is_file() && is_mapping {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

/// Zips the store file and every mapping file, with a sha256 per entry in the
/// manifest.
pub fn export_snapshot(
    store_path: &Path,
    mapping_dir: &Path,
    out_path: &Path,
) -> anyhow::Result<SnapshotSummary> {
    if !store_path.is_file() {
        return Err(anyhow!(
            "store database not found: {}",
            store_path.to_string_lossy()
        ));
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    let store_bytes = std::fs::read(store_path)
        .with_context(|| format!("failed to read {}", store_path.to_string_lossy()))?;
    entries.push((STORE_ENTRY.to_string(), store_bytes));

    let mut names = Vec::new();
    for p in mapping_files(mapping_dir)? {
        let Some(name) = p.file_name().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let bytes =
            std::fs::read(&p).with_context(|| format!("failed to read {}", p.to_string_lossy()))?;
        entries.push((format!("{MAPPING_PREFIX}{name}"), bytes));
        names.push(name);
    }

    let checksums: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(name, bytes)| (name.clone(), json!(sha256_hex(bytes))))
        .collect();
    let created_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": SNAPSHOT_FORMAT_V1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "createdAt": created_at,
        "checksums": checksums,
    });

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    write_entry(
        &mut zip,
        MANIFEST_ENTRY,
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
        opts,
    )?;
    for (name, bytes) in &entries {
        write_entry(&mut zip, name, bytes, opts)?;
    }
    zip.finish().context("failed to finalize snapshot")?;

    Ok(SnapshotSummary {
        format: SNAPSHOT_FORMAT_V1.to_string(),
        entry_count: entries.len() + 1,
        mapping_files: names,
    })
}

/// Replaces the store file and the mapping directory contents with the
/// snapshot's. Every entry is checksum-verified before anything is written.
/// The store must not be open while this runs.
pub fn restore_snapshot(
    in_path: &Path,
    store_path: &Path,
    mapping_dir: &Path,
) -> anyhow::Result<RestoreSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open snapshot {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("snapshot missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != SNAPSHOT_FORMAT_V1 {
        return Err(anyhow!("unsupported snapshot format: {}", format));
    }
    let Some(checksums) = manifest.get("checksums").and_then(|v| v.as_object()) else {
        return Err(anyhow!("snapshot manifest has no checksums"));
    };

    let mut verified: Vec<(String, Vec<u8>)> = Vec::new();
    for (name, expected) in checksums {
        let mut bytes = Vec::new();
        archive
            .by_name(name)
            .with_context(|| format!("snapshot missing {name}"))?
            .read_to_end(&mut bytes)
            .with_context(|| format!("failed to read {name}"))?;
        let actual = sha256_hex(&bytes);
        if Some(actual.as_str()) != expected.as_str() {
            return Err(anyhow!(
                "checksum mismatch for {name}: expected={} actual={actual}",
                expected.as_str().unwrap_or("")
            ));
        }
        verified.push((name.clone(), bytes));
    }
    if !verified.iter().any(|(n, _)| n == STORE_ENTRY) {
        return Err(anyhow!("snapshot missing {STORE_ENTRY}"));
    }

    if let Some(parent) = store_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    std::fs::create_dir_all(mapping_dir)
        .with_context(|| format!("failed to create directory {}", mapping_dir.to_string_lossy()))?;
    // Mapping lists absent from the snapshot must not survive the restore.
    for p in mapping_files(mapping_dir)? {
        std::fs::remove_file(&p)
            .with_context(|| format!("failed to remove {}", p.to_string_lossy()))?;
    }

    let mut restored = Vec::new();
    for (name, bytes) in verified {
        let dst = if name == STORE_ENTRY {
            store_path.to_path_buf()
        } else if let Some(file) = name.strip_prefix(MAPPING_PREFIX) {
            if file.contains('/') || file.contains('\\') || file.starts_with('.') {
                return Err(anyhow!("refusing snapshot entry {name}"));
            }
            restored.push(file.to_string());
            mapping_dir.join(file)
        } else {
            continue;
        };
        replace_file(&dst, &bytes)?;
    }
    restored.sort();

    Ok(RestoreSummary {
        format: SNAPSHOT_FORMAT_V1.to_string(),
        mapping_files: restored,
    })
}

fn replace_file(dst: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = dst.with_extension("restoring");
    if tmp.exists() {
        let _ = std::fs::remove_file(&tmp);
    }
    let mut f = File::create(&tmp)
        .with_context(|| format!("failed to create {}", tmp.to_string_lossy()))?;
    f.write_all(bytes)
        .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
    f.flush().context("failed to flush restored file")?;
    drop(f);
    std::fs::rename(&tmp, dst)
        .with_context(|| format!("failed to move restored file to {}", dst.to_string_lossy()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn tampered_entry_is_rejected_before_anything_is_written() {
        let dir = temp_dir("migrated-snapshot-tamper");
        let store = dir.join("migration.sqlite3");
        std::fs::write(&store, b"store-bytes").expect("write store");
        let mappings = dir.join("mappings");
        std::fs::create_dir_all(&mappings).expect("mkdir");
        std::fs::write(mappings.join("users_mapping.json"), b"[]").expect("write mapping");

        let good = dir.join("good.zip");
        export_snapshot(&store, &mappings, &good).expect("export");

        // Rebuild the archive with the same manifest but different store bytes.
        let mut manifest = String::new();
        {
            let mut a = ZipArchive::new(File::open(&good).expect("open")).expect("zip");
            a.by_name(MANIFEST_ENTRY)
                .expect("manifest")
                .read_to_string(&mut manifest)
                .expect("read");
        }
        let bad = dir.join("bad.zip");
        let mut zip = ZipWriter::new(File::create(&bad).expect("create"));
        let opts = FileOptions::default();
        write_entry(&mut zip, MANIFEST_ENTRY, manifest.as_bytes(), opts).expect("manifest");
        write_entry(&mut zip, STORE_ENTRY, b"evil", opts).expect("store");
        write_entry(&mut zip, "mappings/users_mapping.json", b"[]", opts).expect("mapping");
        zip.finish().expect("finish");

        std::fs::write(&store, b"current").expect("rewrite store");
        let e = restore_snapshot(&bad, &store, &mappings).expect_err("must fail");
        assert!(format!("{e:#}").contains("checksum mismatch"));
        assert_eq!(std::fs::read(&store).expect("read"), b"current");

        let _ = std::fs::remove_dir_all(dir);
    }
}
