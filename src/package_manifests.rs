//! C6: REST query against the PackageManifests service for Win32 Store
//! package manifests.

use crate::http::{Header, MsHttpClient};
use crate::Error;
use serde::Deserialize;

const BASE_URL: &str = "https://storeedgefd.dsx.mp.microsoft.com/v9.0/packageManifests";

/// A single Win32 installer entry in a package manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct Installer {
    #[serde(rename = "InstallerType")]
    pub installer_type: Option<String>,
    #[serde(rename = "Architecture")]
    pub architecture: Option<String>,
    #[serde(rename = "InstallerLocale")]
    pub installer_locale: Option<String>,
    #[serde(rename = "InstallerUrl")]
    pub installer_url: Option<String>,
    #[serde(rename = "InstallerSha256")]
    pub installer_sha256: Option<String>,
    #[serde(rename = "Scope")]
    pub scope: Option<String>,
    #[serde(rename = "InstallerSwitches")]
    pub installer_switches: Option<InstallerSwitches>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstallerSwitches {
    #[serde(rename = "Silent")]
    pub silent: Option<String>,
    #[serde(rename = "Custom")]
    pub custom: Option<String>,
}

/// The `DefaultLocale` block of a package version: the descriptive
/// metadata surfaced by `store get`/`list-packages`.
#[derive(Clone, Debug, Deserialize)]
pub struct DefaultLocaleManifest {
    #[serde(rename = "PackageName")]
    pub package_name: Option<String>,
    #[serde(rename = "Publisher")]
    pub publisher: Option<String>,
    #[serde(rename = "ShortDescription")]
    pub short_description: Option<String>,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "Category")]
    pub category: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PackageVersion {
    #[serde(rename = "PackageVersion")]
    pub package_version: Option<String>,
    #[serde(rename = "DefaultLocale")]
    pub default_locale: Option<DefaultLocaleManifest>,
    #[serde(rename = "Installers")]
    pub installers: Vec<Installer>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PackageManifestData {
    #[serde(rename = "Versions")]
    pub versions: Vec<PackageVersion>,
}

/// A raw PackageManifests response, `IsFound=false` once a 404 has been
/// mapped, per spec.md §4.6.
#[derive(Clone, Debug)]
pub struct PackageManifestsResult {
    pub data: Option<PackageManifestData>,
}

impl PackageManifestsResult {
    pub fn is_found(&self) -> bool {
        self.data.is_some()
    }

    /// `AppType = "MSIX/AppX"` iff any installer's `InstallerType` equals
    /// `"msstore"`.
    pub fn is_msstore(&self) -> bool {
        self.data
            .iter()
            .flat_map(|d| d.versions.iter())
            .flat_map(|v| v.installers.iter())
            .any(|i| i.installer_type.as_deref() == Some("msstore"))
    }

    /// Every installer paired with the `PackageVersion.package_version` it
    /// was declared under, so a caller that picks an installer by
    /// architecture/locale can still report which version it came from.
    pub fn all_installers_with_version(&self) -> Vec<(&str, &Installer)> {
        self.data
            .iter()
            .flat_map(|d| d.versions.iter())
            .flat_map(|v| {
                let version = v.package_version.as_deref().unwrap_or_default();
                v.installers.iter().map(move |i| (version, i))
            })
            .collect()
    }

    /// The most recently declared `DefaultLocale` block, if any version
    /// carries one.
    pub fn default_locale(&self) -> Option<&DefaultLocaleManifest> {
        self.data
            .iter()
            .flat_map(|d| d.versions.iter())
            .rev()
            .find_map(|v| v.default_locale.as_ref())
    }
}

pub struct PackageManifestsClient<'a> {
    http: &'a MsHttpClient,
}

impl<'a> PackageManifestsClient<'a> {
    pub fn new(http: &'a MsHttpClient) -> Self {
        Self { http }
    }

    pub fn query(
        &self,
        big_id: &str,
        market: Option<&str>,
        _language: Option<&str>,
    ) -> Result<PackageManifestsResult, Error> {
        let big_id = big_id.to_ascii_uppercase();
        let mut url = format!("{BASE_URL}/{big_id}");
        if let Some(market) = market {
            url.push_str(&format!("?Market={market}"));
        }

        let response = self
            .http
            .get(&url, &[Header("Accept", "application/json")])?;

        if response.status == 404 {
            return Ok(PackageManifestsResult { data: None });
        }
        if response.status >= 400 {
            return Err(Error::TransportOther {
                operation: format!("GET {url}"),
                message: format!("unexpected status {}", response.status),
            });
        }

        #[derive(Deserialize)]
        struct Envelope {
            #[serde(rename = "Data")]
            data: PackageManifestData,
        }

        let envelope: Envelope = response.json()?;
        Ok(PackageManifestsResult {
            data: Some(envelope.data),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_msstore_installer_type() {
        let result = PackageManifestsResult {
            data: Some(PackageManifestData {
                versions: vec![PackageVersion {
                    package_version: Some("1.0".into()),
                    default_locale: None,
                    installers: vec![Installer {
                        installer_type: Some("msstore".into()),
                        architecture: None,
                        installer_locale: None,
                        installer_url: None,
                        installer_sha256: None,
                        scope: None,
                        installer_switches: None,
                    }],
                }],
            }),
        };
        assert!(result.is_msstore());
    }

    #[test]
    fn not_found_has_no_data() {
        let result = PackageManifestsResult { data: None };
        assert!(!result.is_found());
        assert!(!result.is_msstore());
    }
}
