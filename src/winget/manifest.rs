//! C10: resolves a WinGet package/version to its YAML manifest, via a
//! content-addressed CDN path derived from the catalog's package hash.

use crate::http::MsHttpClient;
use crate::model::Architecture;
use crate::mszip;
use crate::util::lowercase_hex;
use crate::winget::catalog::WingetCatalog;
use crate::Error;
use serde::Deserialize;

const HASH8_LEN: usize = 4;

/// The `versionData.mszyml` document: a list of version/relative-path
/// entries keyed by `vD`.
#[derive(Clone, Debug, Deserialize)]
pub struct VersionData {
    #[serde(rename = "vD")]
    pub v_d: Vec<VersionDataEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct VersionDataEntry {
    pub v: String,
    #[serde(rename = "rP")]
    pub r_p: String,
}

/// The fully resolved manifest: the downloaded YAML document plus the
/// decoded `versionData.mszyml` blob it was resolved from.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub package_version: String,
    pub document: serde_yaml::Value,
    pub version_data: VersionData,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Machine,
    User,
}

/// A resolved installer selection, per spec.md §4.10
/// `GetPackageInstaller`.
#[derive(Clone, Debug)]
pub struct PackageInstaller {
    pub installer_type: String,
    pub nested_installer_type: Option<String>,
    pub nested_installer_files: Vec<String>,
    pub silent: String,
    pub url: String,
    pub scope: Option<Scope>,
}

pub struct WingetManifestFetcher<'a> {
    http: &'a MsHttpClient,
    source_base: String,
}

impl<'a> WingetManifestFetcher<'a> {
    pub fn new(http: &'a MsHttpClient, source_base: impl Into<String>) -> Self {
        Self {
            http,
            source_base: source_base.into(),
        }
    }

    pub fn get_manifest(
        &self,
        catalog: &WingetCatalog,
        package_id: &str,
        version: Option<&str>,
    ) -> Result<Manifest, Error> {
        let (latest_version, hash) = catalog.package_hash(package_id)?;
        let package_version = version.unwrap_or(&latest_version).to_string();

        if hash.len() < HASH8_LEN {
            return Err(Error::decode(
                "winget package hash",
                "expected at least 4 bytes",
            ));
        }
        let hash8 = lowercase_hex(&hash[..HASH8_LEN]);

        let version_data_url = format!(
            "{}/packages/{package_id}/{hash8}/versionData.mszyml",
            self.source_base.trim_end_matches('/')
        );
        let response = self.http.get(&version_data_url, &[])?;
        let decoded = mszip::decode(&response.body)?;
        let version_data: VersionData = serde_yaml::from_slice(&decoded)
            .map_err(|e| Error::decode("versionData.mszyml", e))?;

        let entry = version_data
            .v_d
            .iter()
            .find(|e| e.v == package_version)
            .ok_or_else(|| {
                Error::not_found(format!("version {package_version} of {package_id}"))
            })?;

        let manifest_url = format!(
            "{}/{}",
            self.source_base.trim_end_matches('/'),
            entry.r_p.trim_start_matches('/')
        );
        let manifest_response = self.http.get(&manifest_url, &[])?;
        let document: serde_yaml::Value = serde_yaml::from_slice(&manifest_response.body)
            .map_err(|e| Error::decode("winget manifest yaml", e))?;

        Ok(Manifest {
            package_version,
            document,
            version_data,
        })
    }

    pub fn get_package_installer(
        &self,
        manifest: &Manifest,
        arch: Architecture,
        backup_arch: Option<Architecture>,
        scope: Option<Scope>,
    ) -> Result<PackageInstaller, Error> {
        let installers = manifest
            .document
            .get("Installers")
            .and_then(|v| v.as_sequence())
            .ok_or_else(|| Error::decode("winget manifest", "missing Installers array"))?;

        let chosen = best_installer(installers, |i| matches_arch(i, arch) && matches_scope(i, scope))
            .or_else(|| {
                backup_arch.and_then(|a| best_installer(installers, |i| matches_arch(i, a)))
            })
            .or_else(|| installers.first())
            .ok_or_else(|| Error::not_found("winget installer matching architecture"))?;

        let installer_type = chosen
            .get("InstallerType")
            .and_then(|v| v.as_str())
            .or_else(|| manifest.document.get("InstallerType").and_then(|v| v.as_str()))
            .unwrap_or("exe")
            .to_string();

        let nested_installer_type = chosen
            .get("NestedInstallerType")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let nested_installer_files = chosen
            .get("NestedInstallerFiles")
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|f| f.get("RelativeFilePath"))
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let silent = chosen
            .get("InstallerSwitches")
            .and_then(|s| s.get("Silent"))
            .and_then(|v| v.as_str())
            .or_else(|| {
                chosen
                    .get("InstallerSwitches")
                    .and_then(|s| s.get("Custom"))
                    .and_then(|v| v.as_str())
            })
            .map(str::to_string)
            .unwrap_or_else(|| default_silent_switches(&installer_type).to_string());

        let url = chosen
            .get("InstallerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::decode("winget installer", "missing InstallerUrl"))?
            .to_string();

        Ok(PackageInstaller {
            installer_type,
            nested_installer_type,
            nested_installer_files,
            silent,
            url,
            scope,
        })
    }
}

/// Among installers satisfying `predicate`, prefers `msi`/`wix` over any
/// other `InstallerType` (the Design Notes' "MSI/WiX form a preferred
/// subclass" rule), falling back to document order within that subclass.
fn best_installer<'a>(
    installers: &'a [serde_yaml::Value],
    predicate: impl Fn(&serde_yaml::Value) -> bool,
) -> Option<&'a serde_yaml::Value> {
    let matching: Vec<&serde_yaml::Value> = installers.iter().filter(|i| predicate(i)).collect();
    matching
        .iter()
        .find(|i| is_msi_like(i))
        .or_else(|| matching.first())
        .copied()
}

fn is_msi_like(installer: &serde_yaml::Value) -> bool {
    matches!(
        installer.get("InstallerType").and_then(|v| v.as_str()),
        Some("msi") | Some("wix")
    )
}

fn matches_arch(installer: &serde_yaml::Value, arch: Architecture) -> bool {
    installer
        .get("Architecture")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<Architecture>().ok())
        == Some(arch)
}

fn matches_scope(installer: &serde_yaml::Value, scope: Option<Scope>) -> bool {
    let Some(scope) = scope else { return true };
    let declared = installer.get("Scope").and_then(|v| v.as_str());
    match (scope, declared) {
        (Scope::Machine, Some("machine")) => true,
        (Scope::User, Some("user")) => true,
        (_, None) => true,
        _ => false,
    }
}

fn default_silent_switches(installer_type: &str) -> &'static str {
    match installer_type {
        "msi" | "wix" => "/quiet /norestart",
        "inno" => "/SP- /VERYSILENT /NORESTART",
        "nullsoft" => "/S",
        _ => "",
    }
}

/// Exposed for callers that want the raw hash→CDN-path derivation without
/// a full manifest fetch (e.g. pre-warming a cache).
pub fn hash8(hash: &[u8]) -> Result<String, Error> {
    if hash.len() < HASH8_LEN {
        return Err(Error::decode("hash", "expected at least 4 bytes"));
    }
    Ok(lowercase_hex(&hash[..HASH8_LEN]))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash8_is_lowercase_hex_of_first_four_bytes() {
        let hash = vec![0xDE, 0xAD, 0xBE, 0xEF, 0xFF, 0xFF];
        assert_eq!(hash8(&hash).unwrap(), "deadbeef");
    }

    #[test]
    fn hash8_rejects_short_hash() {
        assert!(hash8(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn default_silent_switches_match_table() {
        assert_eq!(default_silent_switches("msi"), "/quiet /norestart");
        assert_eq!(default_silent_switches("nullsoft"), "/S");
        assert_eq!(default_silent_switches("portable"), "");
    }
}
