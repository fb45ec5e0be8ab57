mod common;

use runphar::diff::ContentDiff;
use runphar::{diff, BuildOptions, Compression, DiffContext, DiffMode, FileCollector, PharArchive};

const MODES: [DiffMode; 4] = [DiffMode::FileName, DiffMode::Checksum, DiffMode::Git, DiffMode::Gnu];

const FILES: &[(&str, &[u8])] = &[
    ("index.php", b"<?php\nrequire 'src/App.php';\n"),
    ("src/App.php", b"<?php\nclass App\n{\n}\n"),
];

#[tokio::test]
async fn archive_is_identical_to_itself() {
    let bytes = common::build(FILES, Compression::None, BuildOptions::default()).await;
    let archive = common::open("app.phar", bytes).await;
    let ctx = DiffContext::new();

    for mode in MODES {
        if matches!(mode, DiffMode::Git | DiffMode::Gnu) && ctx.executable(mode).is_none() {
            continue;
        }
        let report = diff(&archive, &archive, mode, &ctx).await.unwrap();
        assert!(!report.has_differences(), "{mode:?}: {}", report.render());
    }
}

#[tokio::test]
async fn file_name_mode_is_symmetric() {
    let a = common::open(
        "a.phar",
        common::build(&[("shared.php", b"1"), ("old.php", b"x")], Compression::None, BuildOptions::default()).await,
    )
    .await;
    let b = common::open(
        "b.phar",
        common::build(&[("shared.php", b"2"), ("new.php", b"y"), ("more.php", b"z")], Compression::None, BuildOptions::default()).await,
    )
    .await;
    let ctx = DiffContext::new();

    let ab = diff(&a, &b, DiffMode::FileName, &ctx).await.unwrap().content;
    let ba = diff(&b, &a, DiffMode::FileName, &ctx).await.unwrap().content;
    match (ab, ba) {
        (
            ContentDiff::FileNames { only_in_left: ab_left, only_in_right: ab_right },
            ContentDiff::FileNames { only_in_left: ba_left, only_in_right: ba_right },
        ) => {
            assert_eq!(ab_left, ba_right);
            assert_eq!(ab_right, ba_left);
            assert_eq!(ab_right, ["more.php", "new.php"]);
        }
        other => panic!("unexpected content diffs {other:?}"),
    }
}

#[cfg(feature = "gzip")]
#[tokio::test]
async fn same_content_different_compression() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::create_dir_all(src.join("lib")).unwrap();
    std::fs::write(src.join("index.php"), "<?php echo 'hello';\n").unwrap();
    std::fs::write(src.join("lib/a.php"), "<?php function a() { return 1; }\n").unwrap();

    let mut paths = Vec::new();
    for (name, compression) in [("plain.phar", Compression::None), ("gz.phar", Compression::Gz)] {
        let entries = FileCollector::new(&src)
            .compression(compression)
            .collect()
            .unwrap();
        let phar = runphar::PharBuilder::new(runphar::phar::stub::generate("app.phar", None, false))
            .with_options(BuildOptions {
                timestamp: Some(common::TIMESTAMP),
                ..Default::default()
            })
            .build(entries)
            .await
            .unwrap();
        let path = dir.path().join(name);
        phar.write_to(&path).await.unwrap();
        paths.push(path);
    }

    let a = PharArchive::open(paths[0].to_str().unwrap()).await.unwrap();
    let b = PharArchive::open(paths[1].to_str().unwrap()).await.unwrap();
    let report = diff(&a, &b, DiffMode::Checksum, &DiffContext::new()).await.unwrap();

    assert!(report.content.is_empty());
    assert!(report.has_differences());
    let metadata = report.metadata_diff.unwrap();
    assert!(metadata.contains("-Files Compression: None\n+Files Compression: GZ\n"), "{metadata}");
}
