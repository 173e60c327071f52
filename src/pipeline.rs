//! C8: `StorePipeline`, the orchestrator that ties C4-C7 and C12 together
//! into a single `GetUnifiedStoreAppInfo` call.

use crate::display_catalog::{DisplayCatalogClient, Endpoint};
use crate::fe3::Fe3Client;
use crate::http::MsHttpClient;
use crate::installed::InstalledPrograms;
use crate::locale::{self, DetectedArchitecture};
use crate::model::{
    Architecture, DownloadInfo, InstallScope, ProductId, ResolvedPackage, UnifiedStoreApp,
};
use crate::moniker;
use crate::package_manifests::PackageManifestsClient;
use crate::token::DeviceToken;
use crate::Error;
use std::collections::HashMap;

/// How the caller wants architecture resolved for an MSIX/AppX product.
#[derive(Clone, Debug)]
pub enum ArchitecturePolicy {
    /// Keep every package regardless of architecture.
    All,
    /// Apply the `[Primary, neutral, Fallback...]` preference chain.
    Autodetect(DetectedArchitecture),
    /// Keep only packages matching this exact architecture.
    Exact(Architecture),
}

const APPX_EXTENSIONS_IN_ORDER: &[&str] = &[
    "msixbundle",
    "appxbundle",
    "msix",
    "appx",
    "emsix",
    "eappx",
];

const DEFAULT_SILENT_SWITCHES: &[(&str, &str)] = &[
    ("msi", "/quiet /norestart"),
    ("wix", "/quiet /norestart"),
    ("inno", "/SP- /VERYSILENT /NORESTART"),
    ("nullsoft", "/S"),
    ("exe", ""),
    ("portable", ""),
];

pub struct StorePipeline<'a> {
    display_catalog: DisplayCatalogClient<'a>,
    package_manifests: PackageManifestsClient<'a>,
    fe3: Fe3Client<'a>,
    installed: &'a InstalledPrograms,
}

impl<'a> StorePipeline<'a> {
    pub fn new(http: &'a MsHttpClient, installed: &'a InstalledPrograms) -> Self {
        Self {
            display_catalog: DisplayCatalogClient::new(http),
            package_manifests: PackageManifestsClient::new(http),
            fe3: Fe3Client::new(http),
            installed,
        }
    }

    pub fn get_unified_store_app_info(
        &self,
        product_id: &ProductId,
        market: &str,
        language: &str,
        device_token: &DeviceToken,
        arch_policy: ArchitecturePolicy,
        latest_versions_only: bool,
    ) -> Result<UnifiedStoreApp, Error> {
        let manifest = self
            .package_manifests
            .query(product_id.as_str(), Some(market), Some(language))?;

        if !manifest.is_found() {
            return Err(Error::not_found(format!(
                "package manifest for {product_id}"
            )));
        }

        if manifest.is_msstore() {
            self.resolve_msix(
                product_id,
                market,
                language,
                device_token,
                arch_policy,
                latest_versions_only,
            )
        } else {
            self.resolve_win32(product_id, &manifest)
        }
    }

    fn resolve_win32(
        &self,
        product_id: &ProductId,
        manifest: &crate::package_manifests::PackageManifestsResult,
    ) -> Result<UnifiedStoreApp, Error> {
        let detected_arch = locale::detect_architecture();
        let detected_locale = locale::detect_locale();

        let installers = manifest.all_installers_with_version();

        let by_arch: Vec<(&str, &crate::package_manifests::Installer)> =
            locale::prefer_architecture(&installers, &detected_arch, |(_, i)| {
                i.architecture
                    .as_deref()
                    .and_then(|a| a.parse::<Architecture>().ok())
            })
            .into_iter()
            .copied()
            .collect();
        if by_arch.is_empty() {
            return Err(Error::not_found(format!(
                "Win32 installer matching host architecture for {product_id}"
            )));
        }

        let chosen_pair = *locale::prefer_locale(&by_arch, &detected_locale, true, |(_, i)| {
            i.installer_locale.as_deref()
        })
        .or_else(|| by_arch.first())
        .ok_or_else(|| Error::not_found(format!("Win32 installer for {product_id}")))?;
        let (version, chosen) = chosen_pair;

        let architecture = chosen
            .architecture
            .as_deref()
            .and_then(|a| a.parse::<Architecture>().ok())
            .unwrap_or(detected_arch.primary);

        let installer_type = chosen.installer_type.clone().unwrap_or_default();
        let silent_switches = chosen
            .installer_switches
            .as_ref()
            .and_then(|s| s.silent.clone().or_else(|| s.custom.clone()))
            .unwrap_or_else(|| default_silent_switches(&installer_type).to_string());

        let scope = match chosen.scope.as_deref() {
            Some("machine") => InstallScope::Machine,
            Some("user") => InstallScope::User,
            _ => InstallScope::Unspecified,
        };

        let installer_url = chosen
            .installer_url
            .clone()
            .ok_or_else(|| Error::decode("Win32 installer", "missing InstallerUrl"))?;

        let default_locale = manifest.default_locale();

        Ok(UnifiedStoreApp {
            product_id: product_id.clone(),
            app_type: crate::model::AppType::Win32,
            display_name: default_locale
                .and_then(|l| l.package_name.clone())
                .unwrap_or_default(),
            publisher: default_locale
                .and_then(|l| l.publisher.clone())
                .unwrap_or_default(),
            description: default_locale
                .and_then(|l| l.description.clone().or_else(|| l.short_description.clone()))
                .unwrap_or_default(),
            category: default_locale
                .and_then(|l| l.category.clone())
                .unwrap_or_default(),
            version: version.to_string(),
            release_date: None,
            is_free: true,
            price: None,
            download_info: DownloadInfo::Win32 {
                installer_url,
                sha256: chosen.installer_sha256.clone(),
                silent_switches,
                architecture,
                locale: chosen.installer_locale.clone(),
                scope,
                installer_type,
            },
        })
    }

    fn resolve_msix(
        &self,
        product_id: &ProductId,
        market: &str,
        language: &str,
        device_token: &DeviceToken,
        arch_policy: ArchitecturePolicy,
        latest_versions_only: bool,
    ) -> Result<UnifiedStoreApp, Error> {
        let catalog = self
            .display_catalog
            .query(product_id.as_str(), market, language, Endpoint::Production)?;
        if !catalog.is_found() {
            return Err(Error::not_found(format!("DisplayCatalog entry for {product_id}")));
        }
        let wu_category_id = catalog
            .wu_category_id()
            .ok_or_else(|| Error::decode("DisplayCatalog response", "missing WuCategoryId"))?;

        let sync_xml = self.fe3.sync_updates(wu_category_id, device_token.as_str())?;
        let parsed = crate::fe3::parse_update_ids(&sync_xml)?;
        if parsed.update_ids.is_empty() {
            return Err(Error::not_found(format!(
                "FE3 updates for WuCategoryId {wu_category_id}"
            )));
        }

        let urls = self.fe3.get_file_urls(
            &parsed.update_ids,
            &parsed.revision_ids,
            device_token.as_str(),
        )?;
        let update_info = crate::fe3::parse_extended_update_info(&sync_xml)?;

        let mut resolved: Vec<ResolvedPackage> = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            let update_id = parsed
                .update_ids
                .get(i.min(parsed.update_ids.len().saturating_sub(1)))
                .copied()
                .unwrap_or_default();

            let file_name = resolve_file_name(url, &parsed.guid_to_name);
            let info = update_info.get(&update_id).cloned().unwrap_or_default();
            let is_main_package = !info.is_appx_framework && info.package_rank > 100;

            let moniker_str = info.package_moniker.clone();
            let parsed_moniker = moniker_str.as_deref().and_then(moniker::parse);

            resolved.push(ResolvedPackage {
                update_id,
                package_moniker: moniker_str,
                package_name: parsed_moniker
                    .as_ref()
                    .map(|m| m.name.clone())
                    .unwrap_or_default(),
                version: parsed_moniker
                    .as_ref()
                    .map(|m| m.version.clone())
                    .unwrap_or_default(),
                architecture: parsed_moniker
                    .as_ref()
                    .and_then(|m| m.arch.parse::<Architecture>().ok()),
                publisher_id: parsed_moniker.as_ref().map(|m| m.publisher_id.clone()),
                file_name,
                size: info.size.map(|s| s as u64),
                url: url.clone(),
                is_main_package,
                package_rank: info.package_rank,
                installed: false,
            });
        }

        let deduped = dedup_by_file_name(resolved);
        let filtered = filter_by_architecture(deduped, &arch_policy);
        let filtered = if latest_versions_only {
            keep_latest_version_per_name(filtered)
        } else {
            filtered
        };
        let version = filtered
            .iter()
            .find(|p| p.is_main_package)
            .or_else(|| filtered.first())
            .map(|p| p.version.clone())
            .unwrap_or_default();

        let labeled = self.label_installed(filtered);

        let total_size: u64 = labeled.iter().map(|p| p.size.unwrap_or(0)).sum();

        Ok(UnifiedStoreApp {
            product_id: product_id.clone(),
            app_type: crate::model::AppType::MsixOrAppx,
            display_name: catalog.display_name().unwrap_or_default().to_string(),
            publisher: catalog.publisher().unwrap_or_default().to_string(),
            description: catalog.description().unwrap_or_default().to_string(),
            category: catalog.category().unwrap_or_default().to_string(),
            version,
            release_date: None,
            is_free: catalog.is_free(),
            price: catalog.price(),
            download_info: DownloadInfo::MsixOrAppx {
                packages: labeled,
                total_size,
            },
        })
    }

    fn label_installed(&self, packages: Vec<ResolvedPackage>) -> Vec<ResolvedPackage> {
        let inventory = self.installed.appx_inventory();
        packages
            .into_iter()
            .map(|mut pkg| {
                pkg.installed = inventory.iter().any(|entry| {
                    entry.package_name.as_deref() == Some(pkg.package_name.as_str())
                        && entry.architecture == pkg.architecture
                        && version_gte(entry.version.as_deref().unwrap_or(""), &pkg.version)
                });
                pkg
            })
            .collect()
    }
}

fn default_silent_switches(installer_type: &str) -> &'static str {
    DEFAULT_SILENT_SWITCHES
        .iter()
        .find(|(t, _)| *t == installer_type)
        .map(|(_, s)| *s)
        .unwrap_or("")
}

/// Extracts the GUID basename from a FE3 download URL and resolves it
/// against the GUID→Name map, trying AppX/MSIX extensions in priority
/// order when the map holds only a name without an extension. Falls back
/// to `<guid>.appx` when no map entry exists. Never returns a name
/// containing a path separator, per the GUID→Name totality property.
fn resolve_file_name(url: &str, guid_to_name: &HashMap<String, String>) -> String {
    let basename = url
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or(url);
    let guid = basename.rsplit_once('.').map(|(g, _)| g).unwrap_or(basename);

    for ext in APPX_EXTENSIONS_IN_ORDER {
        let key = format!("{guid}.{ext}");
        if let Some(name) = guid_to_name.get(&key) {
            return name.clone();
        }
    }

    format!("{guid}.appx")
}

/// Keeps the first [`ResolvedPackage`] per unique `file_name`. Idempotent:
/// running this twice yields the same result as running it once.
fn dedup_by_file_name(packages: Vec<ResolvedPackage>) -> Vec<ResolvedPackage> {
    let mut seen = std::collections::HashSet::new();
    packages
        .into_iter()
        .filter(|p| seen.insert(p.file_name.clone()))
        .collect()
}

fn filter_by_architecture(
    packages: Vec<ResolvedPackage>,
    policy: &ArchitecturePolicy,
) -> Vec<ResolvedPackage> {
    let mut by_name: HashMap<String, Vec<ResolvedPackage>> = HashMap::new();
    for pkg in packages {
        by_name.entry(pkg.package_name.clone()).or_default().push(pkg);
    }

    let mut result = Vec::new();
    for (_name, group) in by_name {
        match policy {
            ArchitecturePolicy::All => result.extend(group),
            ArchitecturePolicy::Exact(arch) => {
                result.extend(group.into_iter().filter(|p| p.architecture == Some(*arch)))
            }
            ArchitecturePolicy::Autodetect(detected) => {
                let refs = locale::prefer_architecture(&group, detected, |p| p.architecture);
                let chosen: std::collections::HashSet<*const ResolvedPackage> =
                    refs.iter().map(|p| *p as *const ResolvedPackage).collect();
                result.extend(
                    group
                        .into_iter()
                        .filter(|p| chosen.contains(&(p as *const ResolvedPackage))),
                );
            }
        }
    }
    result
}

fn keep_latest_version_per_name(packages: Vec<ResolvedPackage>) -> Vec<ResolvedPackage> {
    let mut by_name: HashMap<String, Vec<ResolvedPackage>> = HashMap::new();
    for pkg in packages {
        by_name.entry(pkg.package_name.clone()).or_default().push(pkg);
    }

    let mut result = Vec::new();
    for (_name, mut group) in by_name {
        group.sort_by(|a, b| compare_versions(&a.version, &b.version));
        if let Some(latest) = group.pop() {
            result.push(latest);
        }
    }
    result
}

fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<versions::Versioning>(), b.parse::<versions::Versioning>()) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

fn version_gte(installed: &str, required: &str) -> bool {
    match (
        installed.parse::<versions::Versioning>(),
        required.parse::<versions::Versioning>(),
    ) {
        (Ok(vi), Ok(vr)) => vi >= vr,
        _ => installed >= required,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pkg(file_name: &str, name: &str, version: &str, arch: Option<Architecture>) -> ResolvedPackage {
        ResolvedPackage {
            update_id: uuid::Uuid::nil(),
            package_moniker: None,
            package_name: name.to_string(),
            version: version.to_string(),
            architecture: arch,
            publisher_id: None,
            file_name: file_name.to_string(),
            size: Some(10),
            url: String::new(),
            is_main_package: false,
            package_rank: 100,
            installed: false,
        }
    }

    #[test]
    fn dedup_is_idempotent() {
        let packages = vec![
            pkg("a.appx", "App", "1.0", None),
            pkg("a.appx", "App", "1.0", None),
            pkg("b.appx", "App", "1.0", None),
        ];
        let once = dedup_by_file_name(packages.clone());
        let twice = dedup_by_file_name(once.clone());
        assert_eq!(once.len(), 2);
        assert_eq!(
            once.iter().map(|p| p.file_name.clone()).collect::<Vec<_>>(),
            twice.iter().map(|p| p.file_name.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn resolve_file_name_falls_back_to_guid_appx() {
        let map = HashMap::new();
        let name = resolve_file_name(
            "https://example.com/11111111-1111-1111-1111-111111111111",
            &map,
        );
        assert_eq!(name, "11111111-1111-1111-1111-111111111111.appx");
        assert!(!name.contains('/'));
    }

    #[test]
    fn resolve_file_name_uses_map_entry() {
        let mut map = HashMap::new();
        map.insert(
            "11111111-1111-1111-1111-111111111111.msixbundle".to_string(),
            "Contoso.App_1.0.0.0_x64__8wekyb3d8bbwe".to_string(),
        );
        let name = resolve_file_name(
            "https://example.com/11111111-1111-1111-1111-111111111111.msixbundle",
            &map,
        );
        assert_eq!(name, "Contoso.App_1.0.0.0_x64__8wekyb3d8bbwe");
    }

    #[test]
    fn keep_latest_version_per_name_picks_greatest() {
        let packages = vec![
            pkg("a.appx", "App", "1.0.0.0", None),
            pkg("b.appx", "App", "2.0.0.0", None),
        ];
        let latest = keep_latest_version_per_name(packages);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "2.0.0.0");
    }

    #[test]
    fn filter_by_architecture_autodetect_never_returns_fallback_when_primary_matches() {
        let detected = DetectedArchitecture {
            primary: Architecture::X64,
            fallback: vec![Architecture::X86],
        };
        let packages = vec![
            pkg("a.appx", "App", "1.0", Some(Architecture::X64)),
            pkg("b.appx", "App", "1.0", Some(Architecture::X86)),
        ];
        let filtered =
            filter_by_architecture(packages, &ArchitecturePolicy::Autodetect(detected));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].architecture, Some(Architecture::X64));
    }
}
