//! Packed archive installation against a real `.tar.gz`.

use std::path::Path;

use berth_repo::{
    ArtifactKind, ArtifactRepository, DescriptorParser, JsonDescriptorParser, DESCRIPTOR_FILE,
};
use flate2::write::GzEncoder;
use flate2::Compression;

fn pack(archive: &Path, files: &[(&str, &str)]) {
    let file = std::fs::File::create(archive).expect("create archive");
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .expect("append entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip");
}

const SHOP: &str = r#"{"group": "org.acme", "name": "shop", "version": "1.0.0", "kind": "application"}"#;

#[test]
fn install_unpacks_and_consumes_archive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = ArtifactRepository::under(dir.path());
    repo.ensure_layout().expect("layout");

    let archive = repo.archive_path(ArtifactKind::Application, "shop");
    pack(&archive, &[(DESCRIPTOR_FILE, SHOP), ("conf/shop.toml", "x = 1")]);
    assert_eq!(
        repo.list(ArtifactKind::Application).expect("list").packed,
        vec!["shop".to_string()]
    );

    let installed = repo
        .install(ArtifactKind::Application, "shop")
        .expect("install");

    assert_eq!(installed, repo.artifact_dir(ArtifactKind::Application, "shop"));
    assert!(!archive.exists());
    assert!(installed.join("conf/shop.toml").is_file());

    let descriptor = JsonDescriptorParser.parse(&installed).expect("parse");
    assert_eq!(descriptor.coordinate.name, "shop");
}

#[test]
fn install_replaces_previous_exploded_copy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = ArtifactRepository::under(dir.path());
    repo.ensure_layout().expect("layout");

    let target = repo.artifact_dir(ArtifactKind::Application, "shop");
    std::fs::create_dir_all(&target).expect("mkdir");
    std::fs::write(target.join("stale.txt"), "old").expect("write stale");

    pack(
        &repo.archive_path(ArtifactKind::Application, "shop"),
        &[(DESCRIPTOR_FILE, SHOP)],
    );
    repo.install(ArtifactKind::Application, "shop")
        .expect("install");

    assert!(!target.join("stale.txt").exists());
    assert!(target.join(DESCRIPTOR_FILE).is_file());
}
