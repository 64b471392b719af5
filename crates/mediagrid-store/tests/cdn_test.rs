//! End-to-end tests over a real temporary filesystem root.
//!
//! JPEG payloads are generated in-memory, so no binary fixtures are
//! needed; byte-equality tests re-read the exact files from disk.

use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use image::{ImageFormat, RgbImage};

use mediagrid_config::testing::TestEnvironment;
use mediagrid_store::{
    CdnData, CdnError, ContentType, RecordingReplicator, UploadFile, Version,
};

/// Encodes a deterministic gradient image of the given size.
fn encode_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 239) as u8])
    });
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), format)
        .unwrap();
    bytes
}

fn create_upload(cdn: &CdnData, content_type: ContentType, bytes: &[u8]) -> UploadFile {
    let upload_file = cdn.uploads().unwrap().create_upload_file(content_type).unwrap();
    fs::write(upload_file.temp_file().unwrap(), bytes).unwrap();
    upload_file
}

fn upload(cdn: &CdnData, content_type: ContentType, bytes: &[u8]) -> mediagrid_store::Result<Version> {
    cdn.find_or_add(&create_upload(cdn, content_type, bytes))
}

fn uploads_dir_entries(cdn: &CdnData) -> Vec<PathBuf> {
    fs::read_dir(cdn.uploads().unwrap().dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[test]
fn deposit_and_redeposit_dedupes() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    let jpeg = encode_image(778, 584, ImageFormat::Jpeg);

    let original = upload(&cdn, ContentType::Jpeg, &jpeg).unwrap();
    assert_eq!(original.content_type(), ContentType::Jpeg);
    assert_eq!(original.filename(), "778x584.jpg");
    let original_image = original.as_image().unwrap();
    assert_eq!(original_image.width(), 778);
    assert_eq!(original_image.height(), 584);

    // Same bytes again: same resource, same version
    let re_upload = upload(&cdn, ContentType::Jpeg, &jpeg).unwrap();
    assert_eq!(re_upload, original);
    assert_eq!(re_upload.resource().id(), original.resource().id());
    assert_eq!(re_upload.filename(), "778x584.jpg");

    // The staging file never survives the operation
    assert!(uploads_dir_entries(&cdn).is_empty());

    // Lookup by identifier resolves the same resource
    let found = cdn
        .resources()
        .get(original.resource().id())
        .unwrap()
        .expect("committed resource must resolve");
    assert_eq!(&found, original.resource());
    assert_eq!(found.original().unwrap(), original);
}

#[test]
fn type_mismatch_is_rejected_and_leaves_nothing() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    let jpeg = encode_image(64, 48, ImageFormat::Jpeg);

    let result = upload(&cdn, ContentType::Gif, &jpeg);
    assert!(matches!(result, Err(CdnError::BadArgument(_))));
    assert!(uploads_dir_entries(&cdn).is_empty());
    assert_eq!(cdn.resources().iter().unwrap().count(), 0);
}

#[test]
fn upload_handle_consumed_once() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    let jpeg = encode_image(32, 32, ImageFormat::Jpeg);

    let upload_file = create_upload(&cdn, ContentType::Jpeg, &jpeg);
    cdn.find_or_add(&upload_file).unwrap();
    assert!(upload_file.temp_file().is_none());
    assert!(matches!(
        cdn.find_or_add(&upload_file),
        Err(CdnError::BadArgument(_))
    ));
}

#[test]
fn upload_handle_rejected_by_other_engine() {
    let env_a = TestEnvironment::new().unwrap();
    let env_b = TestEnvironment::new().unwrap();
    let cdn_a = CdnData::open(&env_a.cdn_root, None, true).unwrap();
    let cdn_b = CdnData::open(&env_b.cdn_root, None, true).unwrap();
    let jpeg = encode_image(32, 32, ImageFormat::Jpeg);

    let upload_file = create_upload(&cdn_a, ContentType::Jpeg, &jpeg);
    assert!(matches!(
        cdn_b.find_or_add(&upload_file),
        Err(CdnError::BadArgument(_))
    ));
    // The handle was not consumed and is still usable on its own engine
    assert!(upload_file.temp_file().is_some());
    cdn_a.find_or_add(&upload_file).unwrap();
}

#[test]
fn non_uploader_peer_has_no_uploads() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, false).unwrap();
    assert!(!cdn.is_uploader());
    assert!(matches!(cdn.uploads(), Err(CdnError::InvalidState(_))));
    assert!(!env.uploads_dir().exists());
}

#[test]
fn scaling_matches_proportional_rules() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    let jpeg = encode_image(778, 584, ImageFormat::Jpeg);

    let Version::Image(original) = upload(&cdn, ContentType::Jpeg, &jpeg).unwrap();

    // Both none and exact match return self
    assert_eq!(original.scale(None, None).unwrap(), original);
    assert_eq!(original.scale(Some(778), Some(584)).unwrap(), original);

    // Scale down by width, proportional height
    let width_scaled = original.scale(Some(389), None).unwrap();
    assert_eq!(width_scaled.width(), 389);
    assert_eq!(width_scaled.height(), 292);
    assert_eq!(width_scaled.filename(), "389x292.jpg");
    assert!(cdn
        .resources()
        .get(original.resource().id())
        .unwrap()
        .unwrap()
        .dir()
        .join("389x292.jpg")
        .is_file());

    // Scale down by height returns the cached version
    assert_eq!(width_scaled.scale(None, Some(292)).unwrap(), width_scaled);
    let height_scaled = original.scale(None, Some(292)).unwrap();
    assert_eq!(height_scaled, width_scaled);
    assert_eq!(height_scaled.width(), 389);
    assert_eq!(height_scaled.height(), 292);

    // Letterboxing horizontal
    assert_eq!(height_scaled.scale(Some(1000), Some(292)).unwrap(), height_scaled);
    assert_eq!(original.scale(Some(1000), Some(584)).unwrap(), original);
    let horizontal = height_scaled.scale(Some(1000), Some(584)).unwrap();
    assert_eq!(horizontal, original);
    assert_eq!(horizontal.width(), 778);
    assert_eq!(horizontal.height(), 584);

    // Letterboxing vertical
    assert_eq!(height_scaled.scale(Some(389), Some(1000)).unwrap(), height_scaled);
    assert_eq!(original.scale(Some(778), Some(1000)).unwrap(), original);
    let vertical = height_scaled.scale(Some(778), Some(1000)).unwrap();
    assert_eq!(vertical, original);

    // Disproportionate smaller requests
    let tall = height_scaled.scale(Some(100), Some(1000)).unwrap();
    assert_eq!(tall.width(), 100);
    assert_eq!(tall.height(), 75);
    assert_eq!(tall.filename(), "100x75.jpg");
    let wide = height_scaled.scale(Some(1000), Some(100)).unwrap();
    assert_eq!(wide.width(), 133);
    assert_eq!(wide.height(), 100);
    assert_eq!(wide.filename(), "133x100.jpg");

    // Scale up clamps to the biggest available version
    assert_eq!(original.scale(Some(1000), Some(1000)).unwrap(), original);
    assert_eq!(width_scaled.scale(Some(1000), Some(1000)).unwrap(), original);
    assert_eq!(height_scaled.scale(Some(1000), Some(1000)).unwrap(), original);

    // Scaling is idempotent
    let again = original.scale(Some(389), None).unwrap();
    assert_eq!(again, width_scaled);
}

#[test]
fn redeposit_of_scaled_version_returns_existing() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    let jpeg = encode_image(778, 584, ImageFormat::Jpeg);

    let Version::Image(original) = upload(&cdn, ContentType::Jpeg, &jpeg).unwrap();
    let scaled = original.scale(Some(389), None).unwrap();

    let scaled_bytes = fs::read(scaled.file()).unwrap();
    let re_uploaded = upload(&cdn, ContentType::Jpeg, &scaled_bytes).unwrap();
    assert_eq!(re_uploaded.filename(), "389x292.jpg");
    assert_eq!(re_uploaded.resource(), original.resource());
    // Only one resource exists
    assert_eq!(cdn.resources().iter().unwrap().count(), 1);
}

#[test]
fn replicator_told_about_commits() {
    let env = TestEnvironment::new().unwrap();
    let recorder = Arc::new(RecordingReplicator::new());
    let cdn =
        CdnData::open_with_replicator(&env.cdn_root, recorder.clone(), true).unwrap();
    let jpeg = encode_image(100, 80, ImageFormat::Jpeg);

    let resources_dir = env.resources_dir();
    // Boot created the resources directory
    assert!(recorder.recorded().contains(&resources_dir));

    let Version::Image(original) = upload(&cdn, ContentType::Jpeg, &jpeg).unwrap();
    let resource_dir = original.resource().dir().to_path_buf();
    // First deposit into an empty tree creates hash1, so that is the
    // replicated ancestor
    let hash1_dir = resource_dir.parent().unwrap().parent().unwrap();
    assert!(recorder.recorded().iter().any(|p| p == hash1_dir));

    let scaled = original.scale(Some(50), None).unwrap();
    assert!(recorder.recorded().contains(&scaled.file().to_path_buf()));
}

#[test]
fn startup_repairs_crashed_deposit() {
    let env = TestEnvironment::new().unwrap();
    // Stray staging directory with a partial payload
    let stray_dir = env
        .create_dir("resources/ab12/cd34/0123abcd.new")
        .unwrap();
    env.create_file(
        "resources/ab12/cd34/0123abcd.new/778x584.jpg",
        b"partial bytes",
    )
    .unwrap();
    // Empty hash directories left behind by an earlier crash
    let empty_hash1 = env.create_dir("resources/ff00/ee11").unwrap();
    let empty_hash1 = empty_hash1.parent().unwrap().to_path_buf();

    let recorder = Arc::new(RecordingReplicator::new());
    let cdn =
        CdnData::open_with_replicator(&env.cdn_root, recorder.clone(), true).unwrap();

    // The staging directory and its contents are gone, and the now-empty
    // hash directories were pruned
    assert!(!stray_dir.exists());
    assert!(!env.resources_dir().join("ab12").exists());
    assert!(!empty_hash1.exists());

    // Deletions were replicated as their highest pruned ancestor
    let recorded = recorder.recorded();
    assert!(recorded.contains(&env.resources_dir().join("ab12")));
    assert!(recorded.contains(&env.resources_dir().join("ff00")));

    // A runtime check is now clean
    let report = cdn.fsck();
    assert!(report.is_empty(), "unexpected issues: {:?}", report);
}

#[test]
fn startup_clears_stale_uploads() {
    let env = TestEnvironment::new().unwrap();
    env.create_file("uploads/upload-stale.jpg", b"stale").unwrap();
    env.create_file("uploads/README.txt", b"keep me visible").unwrap();

    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    assert!(!env.uploads_dir().join("upload-stale.jpg").exists());
    // Unexpected files are reported, not deleted
    assert!(env.uploads_dir().join("README.txt").exists());

    let report = cdn.fsck();
    let issue = report
        .get(&env.uploads_dir().join("README.txt"))
        .expect("unexpected file must be reported");
    assert_eq!(issue.severity(), mediagrid_store::Severity::Warning);
}

#[test]
fn startup_fails_on_severe_issue() {
    let env = TestEnvironment::new().unwrap();
    // A committed resource directory whose original points nowhere
    let dir = env.create_dir("resources/ab12/cd34/01234567").unwrap();
    std::os::unix::fs::symlink("778x584.jpg", dir.join("original.jpg")).unwrap();

    let result = CdnData::open(&env.cdn_root, None, true);
    assert!(matches!(result, Err(CdnError::FsckSevere { severe }) if severe > 0));
}

#[test]
fn runtime_fsck_reports_without_repairing() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    let jpeg = encode_image(60, 40, ImageFormat::Jpeg);
    let Version::Image(original) = upload(&cdn, ContentType::Jpeg, &jpeg).unwrap();

    // A stray staging file inside a committed resource
    let stray = original.resource().dir().join("30x20.jpg.new");
    fs::write(&stray, b"half-rendered").unwrap();

    let report = cdn.fsck();
    let issue = report.get(&stray).expect("stray *.new must be reported");
    assert_eq!(issue.severity(), mediagrid_store::Severity::Info);
    assert!(stray.exists(), "runtime fsck must not delete");

    // Start-up repair removes it
    drop(cdn);
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();
    assert!(!stray.exists());
    assert!(cdn.fsck().is_empty());
}

#[test]
fn png_and_gif_round_trip() {
    let env = TestEnvironment::new().unwrap();
    let cdn = CdnData::open(&env.cdn_root, None, true).unwrap();

    let png = encode_image(120, 90, ImageFormat::Png);
    let png_version = upload(&cdn, ContentType::Png, &png).unwrap();
    assert_eq!(png_version.filename(), "120x90.png");

    let gif = encode_image(80, 60, ImageFormat::Gif);
    let gif_version = upload(&cdn, ContentType::Gif, &gif).unwrap();
    assert_eq!(gif_version.filename(), "80x60.gif");

    // Distinct resources, both resolvable
    assert_ne!(
        png_version.resource().id(),
        gif_version.resource().id()
    );
    assert_eq!(cdn.resources().iter().unwrap().count(), 2);
    assert_eq!(
        cdn.resources()
            .get(png_version.resource().id())
            .unwrap()
            .unwrap()
            .original_content_type()
            .unwrap(),
        ContentType::Png
    );
}
