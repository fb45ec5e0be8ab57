mod common;

use std::collections::BTreeMap;

use runphar::phar::EXTRACT_MARKER_PREFIX;
use runphar::{BuildOptions, Compression, ExtractOptions, Manifest, PharError};

const FILES: &[(&str, &[u8])] = &[
    ("index.php", b"<?php require 'src/App.php'; (new App)->run();\n"),
    ("src/App.php", b"<?php\nclass App { public function run() { echo 'ok'; } }\n"),
    ("assets/logo.bin", &[0u8, 1, 2, 3, 255, 254, 0, 0, 0, 0, 0, 0, 0, 0]),
    ("empty.txt", b""),
];

fn compressions() -> Vec<Compression> {
    let mut all = vec![Compression::None];
    if cfg!(feature = "gzip") {
        all.push(Compression::Gz);
    }
    if cfg!(feature = "bzip2") {
        all.push(Compression::Bz2);
    }
    all
}

fn read_tree(root: &std::path::Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.unwrap();
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(root).unwrap();
            let rel = rel.to_string_lossy().replace('\\', "/");
            if !rel.starts_with(EXTRACT_MARKER_PREFIX) {
                out.insert(rel, std::fs::read(entry.path()).unwrap());
            }
        }
    }
    out
}

#[tokio::test]
async fn build_then_extract_every_compression() {
    for compression in compressions() {
        let bytes = common::build(FILES, compression, BuildOptions::default()).await;
        let archive = common::open("app.phar", bytes).await;

        let dir = tempfile::tempdir().unwrap();
        archive
            .extractor()
            .extract(dir.path(), &ExtractOptions::default())
            .await
            .unwrap();

        let expected: BTreeMap<String, Vec<u8>> = FILES
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_vec()))
            .collect();
        assert_eq!(read_tree(dir.path()), expected, "{compression:?}");
    }
}

#[tokio::test]
async fn single_file_archive() {
    let bytes = common::build(&[("foo.php", b"bar")], Compression::None, BuildOptions::default()).await;
    let archive = common::open("foo.phar", bytes).await;

    let dir = tempfile::tempdir().unwrap();
    let out = archive
        .extractor()
        .extract(dir.path(), &ExtractOptions::default())
        .await
        .unwrap();

    assert_eq!(out, dir.path());
    let tree = read_tree(dir.path());
    assert_eq!(tree.len(), 1);
    assert_eq!(tree["foo.php"], b"bar");
}

#[tokio::test]
async fn directories_are_created() {
    let entries = vec![
        runphar::BuildEntry::directory("cache"),
        runphar::BuildEntry::file("bin/run", "#!/bin/sh\n", Compression::None),
    ];
    let phar = runphar::PharBuilder::new(runphar::phar::stub::generate("d.phar", None, false))
        .build(entries)
        .await
        .unwrap();
    let archive = common::open("d.phar", phar.to_bytes()).await;

    let dir = tempfile::tempdir().unwrap();
    archive
        .extractor()
        .extract(dir.path(), &ExtractOptions::default())
        .await
        .unwrap();
    assert!(dir.path().join("cache").is_dir());
    assert_eq!(std::fs::read(dir.path().join("bin/run")).unwrap(), b"#!/bin/sh\n");
}

#[tokio::test]
async fn corrupted_byte_fails_only_its_entry() {
    let bytes = common::build(FILES, Compression::None, BuildOptions::default()).await;
    let clean = common::open("app.phar", bytes.clone()).await;

    let mut corrupted = bytes;
    corrupted[common::entry_offset(&clean, 1) + 3] ^= 0x20;
    let archive = common::open("app.phar", corrupted).await;
    let extractor = archive.extractor();

    for index in 0..extractor.entries().len() {
        let result = extractor.read(index).await;
        if index == 1 {
            match result {
                Err(PharError::ChecksumMismatch { path, .. }) => assert_eq!(path, "src/App.php"),
                other => panic!("expected a checksum mismatch, got {other:?}"),
            }
        } else {
            assert!(result.is_ok(), "entry {index} should still read");
        }
    }

    // No completion marker for a failed extraction.
    let dir = tempfile::tempdir().unwrap();
    let err = extractor
        .extract(dir.path(), &ExtractOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, PharError::ChecksumMismatch { .. }));
    let marker_written = std::fs::read_dir(dir.path())
        .unwrap()
        .any(|e| e.unwrap().file_name().to_string_lossy().starts_with(EXTRACT_MARKER_PREFIX));
    assert!(!marker_written);
}

#[tokio::test]
async fn any_corrupted_byte_is_a_checksum_mismatch() {
    for compression in compressions() {
        let bytes = common::build(FILES, compression, BuildOptions::default()).await;
        let clean = common::open("app.phar", bytes.clone()).await;
        let start = common::entry_offset(&clean, 1);
        let stored = clean.extractor().entries()[1].compressed_size as usize;

        for offset in start..start + stored {
            let mut corrupted = bytes.clone();
            corrupted[offset] ^= 0x20;
            let archive = common::open("app.phar", corrupted).await;
            let extractor = archive.extractor();

            match extractor.read(1).await {
                // a flip the codec never looks at
                Ok(data) => assert_eq!(data, FILES[1].1, "{compression:?} at {offset}"),
                Err(PharError::ChecksumMismatch { path, .. }) => assert_eq!(path, "src/App.php"),
                Err(other) => panic!("{compression:?} at {offset}: unexpected {other:?}"),
            }
            assert!(extractor.read(0).await.is_ok());
            assert!(extractor.read(2).await.is_ok());
        }
    }
}

#[tokio::test]
async fn lying_size_is_reported() {
    let bytes = common::build(&[("a.php", b"hello")], Compression::None, BuildOptions::default()).await;
    let archive = common::open("a.phar", bytes.clone()).await;
    let stub_end = archive.extractor().stub_end() as usize;

    let mut manifest = Manifest::from_bytes(&bytes[stub_end..]).unwrap();
    manifest.entries[0].uncompressed_size = 6;
    let mut patched = bytes[..stub_end].to_vec();
    patched.extend_from_slice(&manifest.to_bytes());
    patched.extend_from_slice(&bytes[archive.extractor().data_offset() as usize..]);

    let archive = common::open("a.phar", patched).await;
    match archive.extractor().read(0).await {
        Err(PharError::SizeMismatch { expected, actual, .. }) => {
            assert_eq!((expected, actual), (6, 5));
        }
        other => panic!("expected a size mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn extraction_cache_skips_completed_directory() {
    let bytes = common::build(FILES, Compression::None, BuildOptions::default()).await;
    let archive = common::open("app.phar", bytes).await;
    let extractor = archive.extractor();
    let dir = tempfile::tempdir().unwrap();

    extractor.extract(dir.path(), &ExtractOptions::default()).await.unwrap();
    let marker = dir
        .path()
        .join(format!("{EXTRACT_MARKER_PREFIX}{}", extractor.content_hash().await.unwrap()));
    assert!(marker.is_file());

    std::fs::remove_file(dir.path().join("index.php")).unwrap();
    extractor.extract(dir.path(), &ExtractOptions::default()).await.unwrap();
    assert!(!dir.path().join("index.php").exists());

    let no_cache = ExtractOptions {
        use_cache: false,
        ..Default::default()
    };
    extractor.extract(dir.path(), &no_cache).await.unwrap();
    assert!(dir.path().join("index.php").is_file());
}

#[cfg(feature = "gzip")]
#[tokio::test]
async fn whole_archive_compression_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.phar.gz");

    let phar = runphar::PharBuilder::new(runphar::phar::stub::generate("app.phar", None, false))
        .with_options(BuildOptions {
            archive_compression: Compression::Gz,
            ..Default::default()
        })
        .build(common::entries(FILES, Compression::None))
        .await
        .unwrap();
    phar.write_to(&path).await.unwrap();
    assert_eq!(&std::fs::read(&path).unwrap()[..2], &[0x1f, 0x8b]);

    let archive = runphar::PharArchive::open(path.to_str().unwrap()).await.unwrap();
    assert_eq!(archive.archive_compression(), Compression::Gz);
    let info = archive.info().await.unwrap();
    assert!(info.summary_lines().contains(&"Archive Compression: GZ".to_string()));
    assert!(info.summary_lines().contains(&"Files Compression: None".to_string()));

    let contents = common::contents(&archive).await;
    assert_eq!(contents.len(), FILES.len());
    assert_eq!(contents[0].1, FILES[0].1);
}

#[tokio::test]
async fn missing_sentinel_is_reported() {
    let err = runphar::PharArchive::from_bytes("x.phar", b"<?php echo 1;".to_vec())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PharError::SentinelNotFound { .. }));
}
