//! C4: architecture/locale detection and the two preference filters used
//! throughout the Store pipeline to pick a single package out of a
//! candidate list.

use crate::model::Architecture;

/// The running process's preferred architecture and its ordered fallbacks,
/// e.g. an `x64` host also accepts `x86` binaries.
#[derive(Clone, Debug)]
pub struct DetectedArchitecture {
    pub primary: Architecture,
    pub fallback: Vec<Architecture>,
}

/// The running process's preferred locale, in both long (`en-US`) and
/// short (`en`) form.
#[derive(Clone, Debug)]
pub struct DetectedLocale {
    pub full: String,
    pub short: String,
}

/// Reads the OS-reported architecture and locale. On non-Windows hosts (or
/// in tests) this falls back to the build target's architecture and the
/// `LANG`/`LC_ALL` environment, which is sufficient since nothing here
/// depends on a live Windows API call.
pub fn detect_architecture() -> DetectedArchitecture {
    let primary = if cfg!(target_arch = "x86_64") {
        Architecture::X64
    } else if cfg!(target_arch = "aarch64") {
        Architecture::Arm64
    } else if cfg!(target_arch = "arm") {
        Architecture::Arm
    } else {
        Architecture::X86
    };

    let fallback = match primary {
        Architecture::X64 => vec![Architecture::X86],
        Architecture::Arm64 => vec![Architecture::Arm, Architecture::X86],
        _ => Vec::new(),
    };

    DetectedArchitecture { primary, fallback }
}

pub fn detect_locale() -> DetectedLocale {
    let raw = std::env::var("LC_ALL")
        .or_else(|_| std::env::var("LANG"))
        .unwrap_or_else(|_| "en-US".to_string());

    // Strip off any `.UTF-8` encoding suffix and normalize `_` to `-`.
    let full = raw
        .split('.')
        .next()
        .unwrap_or("en-US")
        .replace('_', "-");
    let short = full.split('-').next().unwrap_or("en").to_string();

    DetectedLocale { full, short }
}

/// Returns every item in `packages` whose `architecture(item)` matches the
/// first tier of `[primary, neutral, ...fallback]` that has any match at
/// all. Comparison is case-insensitive; `neutral` always outranks the
/// fallback architectures.
pub fn prefer_architecture<'a, T>(
    packages: &'a [T],
    detected: &DetectedArchitecture,
    architecture: impl Fn(&T) -> Option<Architecture>,
) -> Vec<&'a T> {
    let mut tiers = vec![detected.primary, Architecture::Neutral];
    tiers.extend(detected.fallback.iter().copied());

    for tier in tiers {
        let matches: Vec<&T> = packages
            .iter()
            .filter(|p| architecture(p) == Some(tier))
            .collect();
        if !matches.is_empty() {
            return matches;
        }
    }

    Vec::new()
}

/// Returns the first item in `packages` whose `locale(item)` equals, in
/// order, `detected.full`, `detected.short`, `"en-US"`, `"en"`. Comparison
/// is case-insensitive. `use_english_fallback = false` stops after the
/// first two tiers.
pub fn prefer_locale<'a, T>(
    packages: &'a [T],
    detected: &DetectedLocale,
    use_english_fallback: bool,
    locale: impl Fn(&T) -> Option<&str>,
) -> Option<&'a T> {
    let mut tiers = vec![detected.full.as_str(), detected.short.as_str()];
    if use_english_fallback {
        tiers.push("en-US");
        tiers.push("en");
    }

    for tier in tiers {
        if let Some(found) = packages
            .iter()
            .find(|p| locale(p).is_some_and(|l| l.eq_ignore_ascii_case(tier)))
        {
            return Some(found);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    struct Pkg {
        arch: Option<Architecture>,
        locale: Option<&'static str>,
    }

    #[test]
    fn prefer_architecture_picks_first_nonempty_tier() {
        let detected = DetectedArchitecture {
            primary: Architecture::Arm64,
            fallback: vec![Architecture::X64],
        };
        let packages = vec![
            Pkg { arch: Some(Architecture::X64), locale: None },
            Pkg { arch: Some(Architecture::Neutral), locale: None },
        ];

        // Neutral outranks fallback (x64) even though primary (arm64) has
        // no match at all.
        let picked = prefer_architecture(&packages, &detected, |p| p.arch);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].arch, Some(Architecture::Neutral));
    }

    #[test]
    fn prefer_architecture_falls_back_when_primary_and_neutral_absent() {
        let detected = DetectedArchitecture {
            primary: Architecture::Arm64,
            fallback: vec![Architecture::X64],
        };
        let packages = vec![Pkg { arch: Some(Architecture::X64), locale: None }];

        let picked = prefer_architecture(&packages, &detected, |p| p.arch);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn prefer_architecture_empty_when_nothing_matches() {
        let detected = DetectedArchitecture {
            primary: Architecture::Arm64,
            fallback: vec![],
        };
        let packages = vec![Pkg { arch: Some(Architecture::X86), locale: None }];

        assert!(prefer_architecture(&packages, &detected, |p| p.arch).is_empty());
    }

    #[test]
    fn prefer_locale_prefers_full_over_short_over_english() {
        let detected = DetectedLocale {
            full: "fr-FR".to_string(),
            short: "fr".to_string(),
        };
        let packages = vec![
            Pkg { arch: None, locale: Some("en-US") },
            Pkg { arch: None, locale: Some("fr") },
            Pkg { arch: None, locale: Some("fr-FR") },
        ];

        let picked = prefer_locale(&packages, &detected, true, |p| p.locale).unwrap();
        assert_eq!(picked.locale, Some("fr-FR"));
    }

    #[test]
    fn prefer_locale_falls_back_to_english() {
        let detected = DetectedLocale {
            full: "ja-JP".to_string(),
            short: "ja".to_string(),
        };
        let packages = vec![Pkg { arch: None, locale: Some("en-US") }];

        let picked = prefer_locale(&packages, &detected, true, |p| p.locale).unwrap();
        assert_eq!(picked.locale, Some("en-US"));
    }

    #[test]
    fn prefer_locale_without_english_fallback_returns_none() {
        let detected = DetectedLocale {
            full: "ja-JP".to_string(),
            short: "ja".to_string(),
        };
        let packages = vec![Pkg { arch: None, locale: Some("en-US") }];

        assert!(prefer_locale(&packages, &detected, false, |p| p.locale).is_none());
    }
}
