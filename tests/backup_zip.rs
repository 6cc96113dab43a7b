mod test_support;

use serde_json::json;
use std::io::{Read, Write};
use test_support::{
    create_student, request_err, request_ok, select_workspace, spawn_sidecar, str_field, temp_dir,
};

#[test]
fn export_then_import_into_a_fresh_workspace() {
    let source = temp_dir("registrard-backup-src");
    let target = temp_dir("registrard-backup-dst");
    let bundle = source.join("out").join("workspace.zip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &source);

    let student = create_student(&mut stdin, &mut reader, "SV800", 2022);
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "export",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(exported["bundleFormat"], json!("registrar-workspace-v1"));
    assert_eq!(exported["entryCount"], json!(2));
    let sha = str_field(&exported, "dbSha256");
    assert_eq!(sha.len(), 64);
    assert!(bundle.is_file());

    let imported = request_ok(
        &mut stdin,
        &mut reader,
        "import",
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy(), "workspacePath": target.to_string_lossy() }),
    );
    assert_eq!(imported["dbSha256"], json!(sha));
    assert_eq!(
        imported["workspacePath"],
        json!(target.to_string_lossy())
    );

    // The imported workspace is now the active one.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "students.get",
        json!({ "studentId": student }),
    );
    assert_eq!(got["student"]["studentCode"], json!("SV800"));
}

#[test]
fn tampered_or_missing_bundles_are_rejected() {
    let source = temp_dir("registrard-backup-tamper");
    let bundle = source.join("good.zip");
    let tampered = source.join("tampered.zip");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &source);
    let _ = create_student(&mut stdin, &mut reader, "SV900", 2022);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "export",
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
    );

    // Same database entry, manifest with a wrong checksum.
    {
        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&bundle).expect("open bundle")).expect("zip");
        let mut db_bytes = Vec::new();
        archive
            .by_name("db/registrar.sqlite3")
            .expect("db entry")
            .read_to_end(&mut db_bytes)
            .expect("read db entry");
        let out = std::fs::File::create(&tampered).expect("create tampered");
        let mut zw = zip::ZipWriter::new(out);
        let opts = zip::write::FileOptions::default();
        zw.start_file("manifest.json", opts).expect("manifest");
        zw.write_all(
            json!({ "format": "registrar-workspace-v1", "dbSha256": "0".repeat(64) })
                .to_string()
                .as_bytes(),
        )
        .expect("write manifest");
        zw.start_file("db/registrar.sqlite3", opts).expect("db");
        zw.write_all(&db_bytes).expect("write db");
        zw.finish().expect("finish");
    }

    let code = request_err(
        &mut stdin,
        &mut reader,
        "tampered",
        "backup.importWorkspaceBundle",
        json!({ "inPath": tampered.to_string_lossy() }),
    );
    assert_eq!(code, "io_failed");

    // The original workspace is still usable afterwards.
    let listed = request_ok(&mut stdin, &mut reader, "list", "students.list", json!({}));
    assert_eq!(listed["total"], json!(1));

    let missing = request_err(
        &mut stdin,
        &mut reader,
        "missing",
        "backup.importWorkspaceBundle",
        json!({ "inPath": source.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(missing, "not_found");
}

#[test]
fn rejected_import_into_another_path_keeps_the_current_workspace() {
    let current = temp_dir("registrard-backup-current");
    let elsewhere = temp_dir("registrard-backup-elsewhere");
    let junk = current.join("junk.zip");
    std::fs::write(&junk, b"definitely not a zip archive").expect("write junk");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &current);
    let student = create_student(&mut stdin, &mut reader, "SV950", 2022);

    let code = request_err(
        &mut stdin,
        &mut reader,
        "junk",
        "backup.importWorkspaceBundle",
        json!({ "inPath": junk.to_string_lossy(), "workspacePath": elsewhere.to_string_lossy() }),
    );
    assert_eq!(code, "io_failed");

    let health = request_ok(&mut stdin, &mut reader, "health", "health", json!({}));
    assert_eq!(health["workspacePath"], json!(current.to_string_lossy()));
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "students.get",
        json!({ "studentId": student }),
    );
    assert_eq!(got["student"]["studentCode"], json!("SV950"));
}
