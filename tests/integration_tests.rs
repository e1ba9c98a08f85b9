//! Integration tests for GhostPCB
//!
//! Packages are built in a temporary directory, run through the engine and
//! the written variants are read back and re-parsed.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};
use GhostPCB::{
    archive::ArchiveReader,
    cam::{FileFormat, LayerFile, Position},
    parser::parse_layer,
    Engine, ObfuscateOptions, ProcessRequest,
};

const OUTLINE: &str = "G04 Generated by KiCad 7.0.5 on 2024-01-15 10:20:30*\n%FSLAX46Y46*%\n%MOMM*%\n%ADD10C,0.100000*%\nD10*\nX0Y0D02*\nX50000000Y0D01*\nX50000000Y30000000D01*\nX0Y30000000D01*\nX0Y0D01*\nM02*\n";

const DRILL: &str = "M48\n; DRILL file {KiCad 7.0.5} date 2024-01-15 10:20:30\nMETRIC,TZ,000.000\nT1C0.800\nT2C1.000\n%\nG90\nG05\nT1\nX010000Y010000\nX020000Y010000\nX030000Y015000\nT2\nX040000Y025000\nM30\n";

const SILK: &str = "G04 Generated by KiCad 7.0.5 on 2024-01-15 10:20:30*\n%FSLAX46Y46*%\n%MOMM*%\n%ADD10C,0.150000*%\nD10*\nX1000000Y1000000D02*\nX2000000Y1000000D01*\nX2000000Y2000000D01*\nX5000000Y5000000D02*\nX6000000Y5000000D01*\nM02*\n";

const README: &[u8] = b"Order notes: 2 layers, 1.6 mm, HASL\n";

fn build_package(dir: &Path, name: &str, members: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let file = fs::File::create(&path).expect("Failed to create package");
    let mut zip = ZipWriter::new(file);
    for (member, data) in members {
        zip.start_file(*member, SimpleFileOptions::default())
            .expect("Failed to start member");
        zip.write_all(data).expect("Failed to write member");
    }
    zip.finish().expect("Failed to finish package");
    path
}

fn read_member(zip_path: &str, member: &str) -> Vec<u8> {
    let mut zip = ZipArchive::new(fs::File::open(zip_path).unwrap()).unwrap();
    let mut entry = zip.by_name(member).unwrap();
    let mut data = Vec::new();
    entry.read_to_end(&mut data).unwrap();
    data
}

fn parse_member(zip_path: &str, member: &str, kind: FileFormat) -> LayerFile {
    let text = String::from_utf8(read_member(zip_path, member)).unwrap();
    parse_layer(member, &text, kind).expect("variant must re-parse")
}

/// Absolute positions of every positional node, in file order
fn positions(layer: &LayerFile) -> Vec<Position> {
    layer.locate().into_iter().flatten().map(|l| l.at).collect()
}

fn deltas(before: &LayerFile, after: &LayerFile) -> Vec<Position> {
    let before = positions(before);
    let after = positions(after);
    assert_eq!(before.len(), after.len());
    before
        .iter()
        .zip(&after)
        .map(|(b, a)| (a.0 - b.0, a.1 - b.1))
        .collect()
}

fn max_mm(layer: &LayerFile, delta: Position) -> f64 {
    layer
        .internal_to_mm(delta.0)
        .abs()
        .max(layer.internal_to_mm(delta.1).abs())
}

#[test]
fn test_outline_and_drill_variants() {
    let dir = TempDir::new().unwrap();
    let input = build_package(
        dir.path(),
        "board.zip",
        &[
            ("board-Edge_Cuts.gbr", OUTLINE.as_bytes()),
            ("board.drl", DRILL.as_bytes()),
        ],
    );

    let mut request = ProcessRequest::new(input.display().to_string(), 3);
    request.options = ObfuscateOptions {
        physical: true,
        geometry: true,
        ..ObfuscateOptions::none()
    };
    let result = Engine::new().with_seed(2024).process(&request);

    assert!(result.success, "{}", result.message);
    assert_eq!(result.output_files.len(), 3);
    assert!(result.message.starts_with("Generated 3 of 3 variants"));

    let source_outline = parse_layer("board-Edge_Cuts.gbr", OUTLINE, FileFormat::Gerber).unwrap();
    let source_drill = parse_layer("board.drl", DRILL, FileFormat::Excellon).unwrap();

    let mut fingerprints = HashSet::new();
    for (i, output) in result.output_files.iter().enumerate() {
        assert!(output.ends_with(&format!("board_obf{}.zip", i + 1)));

        let outline = parse_member(output, "board-Edge_Cuts.gbr", FileFormat::Gerber);
        let shifts = deltas(&source_outline, &outline);
        assert!(shifts.iter().all(|d| *d == shifts[0]), "outline must move rigidly");
        assert!(max_mm(&outline, shifts[0]) <= 0.01 + 1e-9);
        assert_ne!(shifts[0], (0, 0));

        let drill = parse_member(output, "board.drl", FileFormat::Excellon);
        for delta in deltas(&source_drill, &drill) {
            assert!(max_mm(&drill, delta) <= 0.02 + 1e-9);
        }

        let archive = ArchiveReader::load(Path::new(output)).unwrap();
        assert!(fingerprints.insert(archive.fingerprint()));
    }

    let source = ArchiveReader::load(&input).unwrap();
    assert!(!fingerprints.contains(&source.fingerprint()));
}

#[test]
fn test_corrupt_input_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("broken.zip");
    fs::write(&input, b"PK\x03\x04 this is not really a zip").unwrap();

    let result = Engine::new().process(&ProcessRequest::new(input.display().to_string(), 2));

    assert!(!result.success);
    assert!(result.output_files.is_empty());
    assert!(result.message.contains("Archive error"), "{}", result.message);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_malformed_member_is_reported() {
    let dir = TempDir::new().unwrap();
    let malformed = "%FSLAX46Y45*%\n%MOMM*%\nD10*\nX0Y0D02*\nM02*\n";
    let input = build_package(
        dir.path(),
        "board.zip",
        &[
            ("board-F_Cu.gbr", malformed.as_bytes()),
            ("board-Edge_Cuts.gbr", OUTLINE.as_bytes()),
        ],
    );

    let result = Engine::new()
        .with_seed(3)
        .process(&ProcessRequest::new(input.display().to_string(), 2));

    assert!(result.success, "{}", result.message);
    assert_eq!(result.output_files.len(), 2);
    assert!(result.message.contains("board-F_Cu.gbr"), "{}", result.message);
    for output in &result.output_files {
        assert_eq!(read_member(output, "board-F_Cu.gbr"), malformed.as_bytes());
    }
}

#[test]
fn test_non_cam_members_are_copied_verbatim() {
    let dir = TempDir::new().unwrap();
    let input = build_package(
        dir.path(),
        "board.zip",
        &[
            ("README.txt", README),
            ("board-F_Silkscreen.gbr", SILK.as_bytes()),
            ("board.drl", DRILL.as_bytes()),
        ],
    );

    let out = dir.path().join("variants");
    let mut request = ProcessRequest::new(input.display().to_string(), 4);
    request.output_dir = Some(out.display().to_string());
    let result = Engine::new().with_seed(99).process(&request);

    assert!(result.success, "{}", result.message);
    assert_eq!(result.output_files.len(), 4);
    for output in &result.output_files {
        assert!(Path::new(output).starts_with(fs::canonicalize(&out).unwrap()));
        assert_eq!(read_member(output, "README.txt"), README);

        let mut zip = ZipArchive::new(fs::File::open(output).unwrap()).unwrap();
        let names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["README.txt", "board-F_Silkscreen.gbr", "board.drl"]);
    }
}

#[test]
fn test_silkscreen_and_timestamp_variants() {
    let dir = TempDir::new().unwrap();
    let input = build_package(
        dir.path(),
        "panel.zip",
        &[("panel-F_Silkscreen.gbr", SILK.as_bytes())],
    );
    let reference = NaiveDate::from_ymd_opt(2025, 6, 30)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap();

    let mut request = ProcessRequest::new(input.display().to_string(), 3);
    request.options = ObfuscateOptions {
        timestamp: true,
        silkscreen: true,
        structure: true,
        ..ObfuscateOptions::none()
    };
    let result = Engine::new()
        .with_seed(5)
        .with_reference_time(reference)
        .process(&request);
    assert!(result.success, "{}", result.message);

    let source = parse_layer("panel-F_Silkscreen.gbr", SILK, FileFormat::Gerber).unwrap();
    for output in &result.output_files {
        let silk = parse_member(output, "panel-F_Silkscreen.gbr", FileFormat::Gerber);
        for delta in deltas(&source, &silk) {
            assert!(max_mm(&silk, delta) <= 0.05 + 1e-9);
        }

        let text = String::from_utf8(read_member(output, "panel-F_Silkscreen.gbr")).unwrap();
        assert!(!text.contains("2024-01-15 10:20:30"));
        assert!(text.contains("2025-06-"));
        assert!(text.ends_with("M02*\n"));

        let mut zip = ZipArchive::new(fs::File::open(output).unwrap()).unwrap();
        let modified = zip.by_index(0).unwrap().last_modified().unwrap();
        assert_eq!((modified.year(), modified.month()), (2025, 6));
    }
}

#[test]
fn test_all_options_disabled_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = build_package(dir.path(), "board.zip", &[("board.drl", DRILL.as_bytes())]);

    let mut request = ProcessRequest::new(input.display().to_string(), 2);
    request.options = ObfuscateOptions::none();
    let result = Engine::new().process(&request);

    assert!(!result.success);
    assert!(result.output_files.is_empty());
    assert!(!dir.path().join("board_obf1.zip").exists());
}

#[test]
fn test_same_seed_same_variants() {
    let dir = TempDir::new().unwrap();
    let input = build_package(
        dir.path(),
        "board.zip",
        &[
            ("board-Edge_Cuts.gbr", OUTLINE.as_bytes()),
            ("board.drl", DRILL.as_bytes()),
            ("board-F_Silkscreen.gbr", SILK.as_bytes()),
        ],
    );
    let reference = NaiveDate::from_ymd_opt(2025, 1, 10)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .unwrap();

    let run = |out: &str| {
        let mut request = ProcessRequest::new(input.display().to_string(), 2);
        request.output_dir = Some(dir.path().join(out).display().to_string());
        Engine::new()
            .with_seed(77)
            .with_reference_time(reference)
            .process(&request)
    };
    let first = run("a");
    let second = run("b");
    assert!(first.success && second.success);

    for (a, b) in first.output_files.iter().zip(&second.output_files) {
        let a = ArchiveReader::load(Path::new(a)).unwrap();
        let b = ArchiveReader::load(Path::new(b)).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
    let a1 = ArchiveReader::load(Path::new(&first.output_files[0])).unwrap();
    let a2 = ArchiveReader::load(Path::new(&first.output_files[1])).unwrap();
    assert_ne!(a1.fingerprint(), a2.fingerprint());
}
