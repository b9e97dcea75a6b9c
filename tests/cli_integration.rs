mod common;

use class_downgrader::reader::parse;
use class_downgrader::version::JavaVersion;
use class_downgrader::writer::serialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::process::Command;

fn write_jar(path: &std::path::Path, entries: &[(&str, &[u8])]) -> anyhow::Result<()> {
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, content) in entries {
        zip.start_file(*name, options)?;
        zip.write_all(content)?;
    }
    zip.finish()?;
    Ok(())
}

fn read_jar_entry(path: &std::path::Path, name: &str) -> anyhow::Result<Vec<u8>> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn run(args: &[&str]) -> anyhow::Result<std::process::Output> {
    let bin = env!("CARGO_BIN_EXE_class-downgrader");
    Ok(Command::new(bin)
        .args(args)
        .env("CLASS_DOWNGRADER_LOG", "warn")
        .output()?)
}

#[test]
fn jar_is_downgraded_and_failures_are_copied() -> anyhow::Result<()> {
    let base = common::temp_dir("cli_jar");
    let input = base.join("in.jar");
    let output = base.join("out/out.jar");
    let report = base.join("report.json");

    let record = serialize(&common::record_point());
    let versioned = common::plain("demo/V", JavaVersion::JAVA_17);
    let broken: &[u8] = b"\xCA\xFE\xBA\xBE\x00";
    write_jar(
        &input,
        &[
            ("demo/Point.class", record.as_slice()),
            ("demo/Broken.class", broken),
            ("META-INF/versions/17/demo/V.class", versioned.as_slice()),
            ("demo/app.properties", b"k=v"),
        ],
    )?;

    let args = [
        "-i",
        input.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "-v",
        "8",
        "-t",
        "2",
        "--report",
        report.to_str().unwrap(),
    ];
    let out = run(&args)?;
    assert_eq!(out.status.code(), Some(1), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let point = parse(&read_jar_entry(&output, "demo/Point.class")?)?;
    assert_eq!(point.major_version, 52);
    assert_eq!(read_jar_entry(&output, "demo/Broken.class")?, broken);
    assert_eq!(read_jar_entry(&output, "META-INF/versions/17/demo/V.class")?, versioned);
    assert_eq!(read_jar_entry(&output, "demo/app.properties")?, b"k=v");

    let report: Value = serde_json::from_slice(&std::fs::read(&report)?)?;
    assert_eq!(report["downgraded"], 1);
    assert_eq!(report["failed"], 1);
    assert_eq!(report["copied"], 2);
    let broken_entry = report["entries"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["name"] == "demo/Broken.class")
        .unwrap();
    assert_eq!(broken_entry["error_kind"], "malformed_class");
    assert_eq!(broken_entry["input_sha256"], broken_entry["output_sha256"]);

    let mut keep_going = args.to_vec();
    keep_going.push("--keep-going");
    let out = run(&keep_going)?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn single_class_file_is_rewritten() -> anyhow::Result<()> {
    let base = common::temp_dir("cli_class");
    std::fs::create_dir_all(&base)?;
    let input = base.join("Point.class");
    let output = base.join("Point8.class");
    std::fs::write(&input, serialize(&common::record_point()))?;

    let out = run(&["-i", input.to_str().unwrap(), "-o", output.to_str().unwrap(), "-v", "java8"])?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(parse(&std::fs::read(&output)?)?.major_version, 52);

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn bad_arguments_exit_with_2() -> anyhow::Result<()> {
    let out = run(&["-i", "a.jar", "-o", "b.jar", "-v", "not-a-version"])?;
    assert_eq!(out.status.code(), Some(2));
    Ok(())
}
