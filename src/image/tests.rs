use super::*;
use crate::layer::LayerBuilder;
use std::io::Read;
use tar::{Builder, Header};

/// Plain tar of regular files, in order
pub(crate) fn tar_files(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

#[derive(Debug)]
pub(crate) struct TestEntry {
    pub path: String,
    pub link: Option<String>,
    pub mtime: u64,
    pub uid: u64,
    pub gid: u64,
    pub data: Vec<u8>,
}

pub(crate) fn untar(data: &[u8]) -> Vec<TestEntry> {
    let mut archive = tar::Archive::new(data);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            TestEntry {
                path: entry.path().unwrap().to_string_lossy().into_owned(),
                link: entry
                    .link_name()
                    .unwrap()
                    .map(|link| link.to_string_lossy().into_owned()),
                mtime: entry.header().mtime().unwrap(),
                uid: entry.header().uid().unwrap(),
                gid: entry.header().gid().unwrap(),
                data,
            }
        })
        .collect()
}

pub(crate) fn untar_layer(layer: &Layer) -> Vec<TestEntry> {
    let mut tar = Vec::new();
    layer.tar_reader().read_to_end(&mut tar).unwrap();
    untar(&tar)
}

fn layer_of(dir: &str, files: &[(&str, &[u8])]) -> Layer {
    LayerBuilder::new(dir)
        .unwrap()
        .build(&tar_files(files)[..])
        .unwrap()
}

#[test]
fn parse_resource_name() {
    assert!(ResourceName::parse("892970").is_ok());
    assert!(ResourceName::parse("denikson/bepinexpack_valheim").is_ok());
    assert!(ResourceName::parse("a/b/c").is_ok());
    assert!(ResourceName::parse("b--alls").is_ok());
    assert!(ResourceName::parse("-balls").is_err());
    assert!(ResourceName::parse("balls/").is_err());
    assert!(ResourceName::parse("Denikson/pack").is_err());
    assert!(ResourceName::parse("a/../b").is_err());
    assert!(ResourceName::parse("").is_err());
}

#[test]
fn parse_reference() {
    assert_eq!(Reference::parse("latest").unwrap(), Reference::Latest);
    assert_eq!(
        Reference::parse("public").unwrap(),
        Reference::Branch("public".into())
    );
    assert_eq!(
        Reference::parse("5.4.2100").unwrap(),
        Reference::Branch("5.4.2100".into())
    );
    assert!(Reference::parse(
        "sha256:0000000000000000000000000000000000000000000000000000000000000000"
    )
    .unwrap()
    .is_content_digest());
    assert!(Reference::parse("sha256:xyz").is_err());
    assert!(Reference::parse(".hidden").is_err());
    assert!(Reference::parse("").is_err());
    assert!(Reference::branch("sha256:00112233445566778899aabbccddeeff").is_err());
    assert!(Reference::branch("latest").unwrap().is_latest());
}

#[test]
fn parse_digest() {
    assert!(ContentDigest::parse("sha256:00112233445566778899aabbccddeeff").is_ok());
    assert!(ContentDigest::parse("sha256:00112233445566778899aabbccddeef").is_err());
    assert!(ContentDigest::parse("sha256:00112233445566778899AABBCCDDEEFF").is_err());
    assert!(ContentDigest::parse(":00112233445566778899aabbccddeeff").is_err());
    let digest = ContentDigest::from_content(b"cat");
    assert_eq!(
        ContentDigest::from_sha256_hex(digest.hex_str()).unwrap(),
        digest
    );
    assert!(digest.matches(b"cat"));
    assert!(!digest.matches(b"dog"));
}

#[test]
fn layers_and_diff_ids_stay_paired() {
    let a = layer_of("a", &[("f", b"1")]);
    let b = layer_of("b", &[("f", b"2")]);
    let mut image = Image::default();
    image.append_layer(a.clone());
    image.append_layer(b.clone());
    assert_eq!(
        image.config().rootfs.diff_ids,
        vec![a.diff_id().clone(), b.diff_id().clone()]
    );
    assert_eq!(image.remove_layer(a.digest()), Some(a.clone()));
    assert_eq!(image.config().rootfs.diff_ids, vec![b.diff_id().clone()]);
    assert_eq!(image.remove_layer(a.digest()), None);
    assert_eq!(image.layer(b.digest()), Some(&b));
}

#[test]
fn render_is_deterministic() {
    let mut first = Image::default();
    first.labels_mut().insert("x".into(), "1".into());
    first.labels_mut().insert("a".into(), "2".into());
    first.append_layer(layer_of("", &[("f", b"1")]));
    let mut second = Image::default();
    second.labels_mut().insert("a".into(), "2".into());
    second.labels_mut().insert("x".into(), "1".into());
    second.append_layer(layer_of("", &[("f", b"1")]));

    let first = first.render().unwrap();
    let second = second.render().unwrap();
    assert_eq!(first.manifest_bytes, second.manifest_bytes);
    assert_eq!(first.manifest_digest, second.manifest_digest);
    assert!(first.manifest_digest.matches(&first.manifest_bytes));
    assert!(first.config_digest.matches(&first.config));
    assert_eq!(first.manifest.layers.len(), 1);
}

#[test]
fn archive_preserves_image() {
    let mut image = Image::default();
    image.labels_mut().insert("k".into(), "v".into());
    image.append_layer(layer_of("one", &[("f", b"1")]));
    image.append_layer(layer_of("two", &[("g", b"2")]));
    let bytes = write_archive(&image, Vec::new()).unwrap();
    let loaded = read_archive(&bytes[..]).unwrap();
    assert_eq!(loaded, image);

    let names: Vec<String> = untar(&bytes).into_iter().map(|e| e.path).collect();
    assert_eq!(names[0], "manifest.json");
    assert!(names[1].starts_with("sha256:"));
    assert!(names[2].ends_with(".tar.gz"));
}

#[test]
fn archive_rejects_corrupt_layer() {
    let mut image = Image::default();
    image.append_layer(layer_of("one", &[("f", b"1")]));
    let bytes = write_archive(&image, Vec::new()).unwrap();

    let mut builder = Builder::new(Vec::new());
    for entry in untar(&bytes) {
        let mut data = entry.data;
        if entry.path.ends_with(".tar.gz") {
            let last = data.len() - 1;
            data[last] ^= 0xff;
        }
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, &entry.path, &data[..])
            .unwrap();
    }
    let corrupt = builder.into_inner().unwrap();
    assert!(matches!(
        read_archive(&corrupt[..]),
        Err(Error::ContentDigestMismatch { .. })
    ));
}

#[test]
fn flatten_prefers_upper_layers() {
    let lower = layer_of("", &[("a", b"lower"), ("b", b"only lower")]);
    let upper = layer_of("", &[("a", b"upper"), ("c", b"only upper")]);
    let entries = untar(&flatten(&[lower, upper]).unwrap());
    let mut files: Vec<(String, Vec<u8>)> =
        entries.into_iter().map(|e| (e.path, e.data)).collect();
    files.sort();
    assert_eq!(
        files,
        vec![
            ("a".to_owned(), b"upper".to_vec()),
            ("b".to_owned(), b"only lower".to_vec()),
            ("c".to_owned(), b"only upper".to_vec()),
        ]
    );
}

#[test]
fn flatten_honors_whiteouts() {
    let lower = layer_of("", &[("dir/a", b"1"), ("dir/b", b"2"), ("keep", b"3")]);
    let upper = layer_of("", &[("dir/.wh.a", b""), ("keep", b"4")]);
    let paths: Vec<String> = untar(&flatten(&[lower.clone(), upper]).unwrap())
        .into_iter()
        .map(|e| e.path)
        .collect();
    assert!(paths.contains(&"dir/b".to_owned()));
    assert!(!paths.contains(&"dir/a".to_owned()));
    assert!(!paths.iter().any(|p| p.contains(".wh.")));

    let opaque = layer_of("", &[("dir/.wh..wh..opq", b""), ("dir/new", b"5")]);
    let paths: Vec<String> = untar(&flatten(&[lower, opaque]).unwrap())
        .into_iter()
        .map(|e| e.path)
        .collect();
    assert!(paths.contains(&"dir/new".to_owned()));
    assert!(!paths.contains(&"dir/b".to_owned()));
    assert!(paths.contains(&"keep".to_owned()));
}

#[test]
fn flatten_of_nothing_is_an_empty_archive() {
    assert!(untar(&flatten(&[]).unwrap()).is_empty());
}
