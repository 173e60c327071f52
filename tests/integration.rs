//! End-to-end scenarios that don't require network access: every fixture
//! here is synthesized in-process.

use msappkit::model::Architecture;

#[test]
fn correlation_vector_is_bounded_and_monotonic() {
    let cv = msappkit::Cv::new();
    let first = cv.value();
    assert!(first.len() <= 63);

    for _ in 0..50 {
        cv.increment();
    }
    let later = cv.value();
    assert!(later.len() <= 63);
    assert_ne!(first, later);
}

#[test]
fn device_token_cache_round_trips_and_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path =
        camino::Utf8PathBuf::from_path_buf(dir.path().join("device-token.cache")).unwrap();

    let provider = msappkit::token::DeviceTokenProvider::new(cache_path);
    let token = provider.get(msappkit::token::GetOptions {
        elevate_if_needed: false,
        skip_cache: false,
    });

    // Without privileges this always resolves to something syntactically
    // valid (the `<Device>...</Device>` shape), never an error.
    assert!(token.as_str().starts_with("<Device>"));
    assert!(token.as_str().ends_with("</Device>"));
}

#[test]
fn package_moniker_grammar_covers_all_three_separator_styles() {
    let four_part =
        msappkit::moniker::parse("Contoso.App_1.0.0.0_x64__8wekyb3d8bbwe").unwrap();
    assert_eq!(four_part.name, "Contoso.App");
    assert_eq!(four_part.version, "1.0.0.0");
    assert_eq!(four_part.arch, "x64");
    assert_eq!(four_part.publisher_id, "8wekyb3d8bbwe");

    let three_part =
        msappkit::moniker::parse("Contoso.App_1.2.3_neutral__8wekyb3d8bbwe").unwrap();
    assert_eq!(three_part.name, "Contoso.App");
    assert_eq!(three_part.version, "1.2.3");
    assert_eq!(three_part.arch, "neutral");

    let tilde =
        msappkit::moniker::parse("Contoso.App_1.0.0.0_x64_~_8wekyb3d8bbwe").unwrap();
    assert_eq!(tilde.name, "Contoso.App");
    assert_eq!(tilde.arch, "x64");

    assert!(msappkit::moniker::parse("not-a-moniker-at-all").is_none());
}

#[test]
fn mszip_round_trips_multi_chunk_payload() {
    use std::io::Write as _;

    let original = b"the quick brown fox jumps over the lazy dog, repeated. ".repeat(200);

    let mut chunk_a = Vec::new();
    {
        let mut enc = flate2::write::DeflateEncoder::new(&mut chunk_a, flate2::Compression::default());
        enc.write_all(&original[..original.len() / 2]).unwrap();
        enc.finish().unwrap();
    }
    let mut chunk_b = Vec::new();
    {
        let mut enc = flate2::write::DeflateEncoder::new(&mut chunk_b, flate2::Compression::default());
        enc.write_all(&original[original.len() / 2..]).unwrap();
        enc.finish().unwrap();
    }

    let mut blob = vec![0u8; 26];
    blob.extend_from_slice(b"\x00\x00\x43\x4B");
    blob.extend_from_slice(&chunk_a);
    blob.extend_from_slice(b"\x00\x00\x43\x4B");
    blob.extend_from_slice(&chunk_b);

    let decoded = msappkit::mszip::decode(&blob).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn architecture_preference_prefers_primary_then_neutral_over_fallback() {
    let detected = msappkit::locale::DetectedArchitecture {
        primary: Architecture::X64,
        fallback: vec![Architecture::X86],
    };

    let candidates = vec![Architecture::Neutral, Architecture::X86];
    let chosen = msappkit::locale::prefer_architecture(&candidates, &detected, |a| Some(*a));
    // Primary (x64) is absent, so neutral outranks the x86 fallback.
    assert_eq!(chosen, vec![&Architecture::Neutral]);
}

#[test]
fn installed_programs_list_is_memoized_and_filters_appx() {
    let installed = msappkit::installed::InstalledPrograms::new(false);
    let first = installed.list();
    let second = installed.list();
    assert_eq!(first.len(), second.len());
    // `include_appx` was false, so the AppX scan never ran regardless of
    // how many Win32 entries the registry scan found.
    assert!(installed.appx_inventory().is_empty());
}
