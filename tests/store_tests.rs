use std::fs;

use zerostore::store::{
    BuilderSink, CancelToken, Config, Error, Fetcher, Manifest, ManifestDigest, ManifestFormat,
    RecipeStep, RetrievalMethod, SilentHandler, Store,
};

fn empty_digest(format: ManifestFormat) -> ManifestDigest {
    ManifestDigest::new_for(format, &format.digest_bytes(b""))
}

#[test]
fn empty_implementation_is_admitted_and_verifies() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();
    let expected = empty_digest(ManifestFormat::Sha256New);

    let path = store
        .add(&expected, &CancelToken::new(), |builder| {
            builder.add_directory("")
        })
        .unwrap();

    assert!(store.contains(&expected));
    assert_eq!(0, fs::metadata(path.join(".manifest")).unwrap().len());
    assert_eq!(vec![expected.clone()], store.list_all().unwrap());
    store.verify(&expected, &SilentHandler).unwrap();
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn single_executable_file_produces_the_documented_identifier() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();

    let line = "X aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d 0 5 run\n";
    let expected_id = format!(
        "sha1new={}",
        ManifestFormat::Sha1New.digest_bytes(line.as_bytes())
    );
    let expected = ManifestDigest::from_id(&expected_id).unwrap();

    let path = store
        .add(&expected, &CancelToken::new(), |builder| {
            builder.add_file("run", &mut "hello".as_bytes(), 0, true)
        })
        .unwrap();

    assert_eq!(Some(expected_id.as_str()), path.file_name().unwrap().to_str());
    assert_eq!(
        line.as_bytes(),
        fs::read(path.join(".manifest")).unwrap().as_slice()
    );
}

#[test]
fn symlink_implementations_hash_the_target_bytes() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();

    let format = ManifestFormat::Sha256New;
    let target = "../target.bin";
    let mut probe = Manifest::new(format);
    probe
        .add_symlink("link", &format.digest_bytes(target.as_bytes()), 13)
        .unwrap();
    let expected = probe.digest_envelope();

    let path = store
        .add(&expected, &CancelToken::new(), |builder| {
            builder.add_symlink("link", target)
        })
        .unwrap();

    let stored = fs::read(path.join(".manifest")).unwrap();
    assert!(stored.starts_with(b"S "));
    store.verify(&expected, &SilentHandler).unwrap();
}

#[test]
fn digest_mismatch_aborts_without_residue() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();
    let expected = empty_digest(ManifestFormat::Sha256New);
    let expected_id = expected.best_id().unwrap();

    let result = store.add(&expected, &CancelToken::new(), |builder| {
        builder.add_file("extra", &mut "x".as_bytes(), 0, false)
    });

    assert!(matches!(result, Err(Error::DigestMismatch { .. })));
    assert!(!root.path().join(expected_id).exists());
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn concurrent_adds_of_the_same_digest_have_one_winner() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();
    let expected = empty_digest(ManifestFormat::Sha256New);

    let results: Vec<_> = std::thread::scope(|scope| {
        (0..2)
            .map(|_| {
                let store = store.clone();
                let expected = expected.clone();
                scope.spawn(move || {
                    store.add(&expected, &CancelToken::new(), |builder| {
                        builder.add_directory("")
                    })
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    let winners = results.iter().filter(|result| result.is_ok()).count();
    let losers = results
        .iter()
        .filter(|result| matches!(result, Err(Error::AlreadyInStore { .. })))
        .count();
    assert_eq!(1, winners);
    assert_eq!(1, losers);
    assert!(store.contains(&expected));
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn stored_manifest_round_trips_byte_for_byte() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();

    let format = ManifestFormat::Sha256;
    let mut probe = Manifest::new(format);
    probe.add_directory("docs").unwrap();
    probe
        .add_file("docs/readme", &format.digest_bytes(b"hi"), 40, 2, false)
        .unwrap();
    probe
        .add_file("tool", &format.digest_bytes(b"#!x"), 20, 3, true)
        .unwrap();
    let expected = probe.digest_envelope();

    let path = store
        .add(&expected, &CancelToken::new(), |builder| {
            builder.add_directory("docs")?;
            builder.add_file("docs/readme", &mut "hi".as_bytes(), 40, false)?;
            builder.add_file("tool", &mut "#!x".as_bytes(), 20, true)
        })
        .unwrap();

    let stored = fs::read(path.join(".manifest")).unwrap();
    let parsed = Manifest::parse(format, &stored).unwrap();
    assert_eq!(stored, parsed.serialize());
    assert_eq!(probe, parsed);
}

#[cfg(unix)]
#[test]
fn optimise_reports_and_reclaims_identical_files() {
    use std::os::unix::fs::MetadataExt;

    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();
    let format = ManifestFormat::Sha256;

    let mut paths = Vec::new();
    for marker in ["first", "second"] {
        let mut probe = Manifest::new(format);
        probe
            .add_file("shared", &format.digest_bytes(b"abc"), 1_700_000_000, 3, false)
            .unwrap();
        probe
            .add_file(
                "marker",
                &format.digest_bytes(marker.as_bytes()),
                0,
                marker.len() as u64,
                false,
            )
            .unwrap();
        let expected = probe.digest_envelope();
        let path = store
            .add(&expected, &CancelToken::new(), |builder| {
                builder.add_file("shared", &mut "abc".as_bytes(), 1_700_000_000, false)?;
                builder.add_file("marker", &mut marker.as_bytes(), 0, false)
            })
            .unwrap();
        paths.push(path);
    }

    assert_eq!(3, store.optimise().unwrap());
    let first = fs::metadata(paths[0].join("shared")).unwrap();
    let second = fs::metadata(paths[1].join("shared")).unwrap();
    assert_eq!(first.ino(), second.ino());

    assert_eq!(0, store.optimise().unwrap());

    // deduplication must not change any verification outcome
    for digest in store.list_all().unwrap() {
        store.verify(&digest, &SilentHandler).unwrap();
    }
}

#[test]
fn concurrent_fetches_of_the_same_digest_converge() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();
    let expected = empty_digest(ManifestFormat::Sha256New);
    let config = Config::default();

    let results: Vec<_> = std::thread::scope(|scope| {
        (0..2)
            .map(|_| {
                let store = store.clone();
                let expected = expected.clone();
                let config = config.clone();
                scope.spawn(move || {
                    let fetcher = Fetcher::new(&store, &config, &SilentHandler);
                    let methods = vec![RetrievalMethod::Recipe(Vec::new())];
                    fetcher
                        .fetch(&expected, &methods, &CancelToken::new())
                        .map(|path| path.is_some())
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert!(results.iter().all(|result| matches!(result, Ok(true))));
    assert!(store.contains(&expected));
    assert_eq!(1, store.list_all().unwrap().len());
    assert!(store.list_temp().unwrap().is_empty());
}

#[test]
fn recipe_with_rename_and_remove_steps() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();
    let format = ManifestFormat::Sha256New;

    // sibling implementation holding the raw content
    let mut sibling = Manifest::new(format);
    sibling
        .add_file("keep", &format.digest_bytes(b"keep"), 10, 4, false)
        .unwrap();
    sibling
        .add_file("drop", &format.digest_bytes(b"drop"), 10, 4, false)
        .unwrap();
    let sibling_digest = sibling.digest_envelope();
    store
        .add(&sibling_digest, &CancelToken::new(), |builder| {
            builder.add_file("keep", &mut "keep".as_bytes(), 10, false)?;
            builder.add_file("drop", &mut "drop".as_bytes(), 10, false)
        })
        .unwrap();

    // target: copy the sibling, drop one file, rename the other
    let mut target = Manifest::new(format);
    target
        .add_file("kept", &format.digest_bytes(b"keep"), 10, 4, false)
        .unwrap();
    let target_digest = target.digest_envelope();

    let methods = vec![RetrievalMethod::Recipe(vec![
        RecipeStep::CopyFrom {
            digest: sibling_digest,
            source: None,
            destination: None,
        },
        RecipeStep::Remove {
            path: "drop".into(),
        },
        RecipeStep::Rename {
            source: "keep".into(),
            destination: "kept".into(),
        },
    ])];

    let config = Config::default();
    let fetcher = Fetcher::new(&store, &config, &SilentHandler);
    let path = fetcher
        .fetch(&target_digest, &methods, &CancelToken::new())
        .unwrap()
        .unwrap();

    assert_eq!(b"keep".as_slice(), fs::read(path.join("kept")).unwrap().as_slice());
    assert!(!path.join("drop").exists());
    store.verify(&target_digest, &SilentHandler).unwrap();
}

#[test]
fn purge_then_readds_cleanly() {
    let root = tempfile::tempdir().unwrap();
    let store = Store::new(root.path()).unwrap();
    let expected = empty_digest(ManifestFormat::Sha256New);

    store
        .add(&expected, &CancelToken::new(), |builder| {
            builder.add_directory("")
        })
        .unwrap();
    store.purge().unwrap();
    assert!(store.list_all().unwrap().is_empty());

    store
        .add(&expected, &CancelToken::new(), |builder| {
            builder.add_directory("")
        })
        .unwrap();
    assert!(store.contains(&expected));
}
