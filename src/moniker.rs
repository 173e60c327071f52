//! PackageMoniker grammar: `<Name>_<Version>_<Arch>(__|_~_)<PublisherId>`.
//!
//! Tried in order, most specific first, since a 4-part version string is a
//! prefix-ambiguous superset of the 3-part form.

use regex::Regex;
use std::sync::OnceLock;

/// The decomposed fields of a parsed `PackageMoniker`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedMoniker {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub publisher_id: String,
}

fn patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"^(.+?)_(\d+\.\d+\.\d+\.\d+)_([^_]+)__(.+)$").expect("valid regex"),
            Regex::new(r"^(.+?)_(\d+\.\d+\.\d+)_([^_]+)__(.+)$").expect("valid regex"),
            Regex::new(r"^(.+?)_(\d+\.\d+\.\d+\.\d+)_([^_]+)_~_(.+)$").expect("valid regex"),
        ]
    })
}

/// Parses a `PackageMoniker` string, returning `None` if none of the three
/// grammars match.
pub fn parse(moniker: &str) -> Option<ParsedMoniker> {
    for re in patterns() {
        if let Some(caps) = re.captures(moniker) {
            return Some(ParsedMoniker {
                name: caps[1].to_string(),
                version: caps[2].to_string(),
                arch: caps[3].to_string(),
                publisher_id: caps[4].to_string(),
            });
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_four_part_version_double_underscore() {
        let parsed = parse("Microsoft.VCLibs.140.00_14.0.30704.0_x64__8wekyb3d8bbwe").unwrap();
        assert_eq!(parsed.name, "Microsoft.VCLibs.140.00");
        assert_eq!(parsed.version, "14.0.30704.0");
        assert_eq!(parsed.arch, "x64");
        assert_eq!(parsed.publisher_id, "8wekyb3d8bbwe");
    }

    #[test]
    fn parses_three_part_version() {
        let parsed = parse("Contoso.App_1.2.3_neutral__publisherid1234").unwrap();
        assert_eq!(parsed.version, "1.2.3");
    }

    #[test]
    fn parses_tilde_separator() {
        let parsed = parse("Contoso.App_1.2.3.4_x86_~_publisherid1234").unwrap();
        assert_eq!(parsed.arch, "x86");
        assert_eq!(parsed.publisher_id, "publisherid1234");
    }

    #[test]
    fn rejects_malformed_moniker() {
        assert!(parse("not-a-moniker").is_none());
    }
}
