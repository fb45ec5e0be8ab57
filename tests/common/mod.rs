#![allow(dead_code)]

use runphar::phar::stub;
use runphar::{BuildEntry, BuildOptions, Compression, PharArchive, PharBuilder};

pub const TIMESTAMP: u32 = 1_509_920_675;

pub fn entries(files: &[(&str, &[u8])], compression: Compression) -> Vec<BuildEntry> {
    files
        .iter()
        .map(|(path, content)| BuildEntry::file(*path, *content, compression))
        .collect()
}

pub async fn build(files: &[(&str, &[u8])], compression: Compression, options: BuildOptions) -> Vec<u8> {
    PharBuilder::new(stub::generate("test.phar", None, false))
        .with_options(BuildOptions {
            timestamp: Some(TIMESTAMP),
            ..options
        })
        .build(entries(files, compression))
        .await
        .unwrap()
        .to_file_bytes()
        .unwrap()
}

pub async fn open(name: &str, bytes: Vec<u8>) -> PharArchive {
    PharArchive::from_bytes(name, bytes).await.unwrap()
}

/// Read every entry back as (path, content).
pub async fn contents(archive: &PharArchive) -> Vec<(String, Vec<u8>)> {
    let extractor = archive.extractor();
    let mut out = Vec::new();
    for (index, entry) in extractor.entries().iter().enumerate() {
        out.push((entry.path.clone(), extractor.read(index).await.unwrap()));
    }
    out
}

/// Absolute offset of entry `index`'s stored bytes.
pub fn entry_offset(archive: &PharArchive, index: usize) -> usize {
    let extractor = archive.extractor();
    let preceding: u64 = extractor.entries()[..index]
        .iter()
        .map(|e| u64::from(e.compressed_size))
        .sum();
    (extractor.data_offset() + preceding) as usize
}
