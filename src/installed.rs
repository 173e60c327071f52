//! C12: a side-service scanning installed Win32 programs (via the
//! uninstall registry keys) and, optionally, installed AppX packages. Used
//! only by C8 to label dependency install status, but also exposed
//! directly through the CLI's `installed list` subcommand.

use crate::model::Architecture;
use parking_lot::Mutex;
use rayon::prelude::*;

/// The kind of installed-program record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ProgramType {
    Win32,
    Appx,
}

/// Which registry view (and therefore install scope) a record came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Scope {
    Machine,
    User,
}

/// A single installed-program record, unified across the Win32 uninstall
/// registry scan and the AppX package scan.
#[derive(Clone, Debug, serde::Serialize)]
pub struct InstalledProgram {
    pub name: String,
    pub program_type: ProgramType,
    pub publisher: Option<String>,
    pub version: Option<String>,
    pub architecture: Option<Architecture>,
    pub package_name: Option<String>,
    pub product_code: Option<String>,
    pub scope: Scope,
}

/// One of the four uninstall-registry views scanned: HKLM/HKCU crossed
/// with native/WOW6432Node.
#[derive(Copy, Clone)]
struct RegistryView {
    hive: RegistryHive,
    wow64_32: bool,
}

#[derive(Copy, Clone)]
enum RegistryHive {
    LocalMachine,
    CurrentUser,
}

const UNINSTALL_PATH_NATIVE: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";
const UNINSTALL_PATH_WOW64: &str =
    r"SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall";

const VIEWS: [RegistryView; 4] = [
    RegistryView { hive: RegistryHive::LocalMachine, wow64_32: false },
    RegistryView { hive: RegistryHive::LocalMachine, wow64_32: true },
    RegistryView { hive: RegistryHive::CurrentUser, wow64_32: false },
    RegistryView { hive: RegistryHive::CurrentUser, wow64_32: true },
];

/// Scans and memoizes the set of installed programs for the current
/// process. The scan itself runs across the four registry views (plus,
/// optionally, AppX) in parallel via rayon; the result is cached after the
/// first call.
pub struct InstalledPrograms {
    include_appx: bool,
    cache: Mutex<Option<Vec<InstalledProgram>>>,
}

impl InstalledPrograms {
    pub fn new(include_appx: bool) -> Self {
        Self {
            include_appx,
            cache: Mutex::new(None),
        }
    }

    /// Returns the memoized full program list, scanning on first call.
    pub fn list(&self) -> Vec<InstalledProgram> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.as_ref() {
            return cached.clone();
        }

        let mut all: Vec<InstalledProgram> = VIEWS
            .par_iter()
            .flat_map(|view| scan_view(*view))
            .collect();

        if self.include_appx {
            all.extend(scan_appx());
        }

        *cache = Some(all.clone());
        all
    }

    /// The subset of [`InstalledProgram`]s that are AppX/MSIX packages,
    /// used by the Store pipeline's install-status labeling.
    pub fn appx_inventory(&self) -> Vec<InstalledProgram> {
        self.list()
            .into_iter()
            .filter(|p| p.program_type == ProgramType::Appx)
            .collect()
    }
}

#[cfg(windows)]
fn scan_view(view: RegistryView) -> Vec<InstalledProgram> {
    use winreg::enums::*;
    use winreg::RegKey;

    let (hive_key, scope) = match view.hive {
        RegistryHive::LocalMachine => (HKEY_LOCAL_MACHINE, Scope::Machine),
        RegistryHive::CurrentUser => (HKEY_CURRENT_USER, Scope::User),
    };
    let path = if view.wow64_32 {
        UNINSTALL_PATH_WOW64
    } else {
        UNINSTALL_PATH_NATIVE
    };

    let flags = if view.wow64_32 {
        KEY_READ | KEY_WOW64_32KEY
    } else {
        KEY_READ | KEY_WOW64_64KEY
    };

    let Ok(uninstall) = RegKey::predef(hive_key).open_subkey_with_flags(path, flags) else {
        return Vec::new();
    };

    let mut programs = Vec::new();
    for product_code in uninstall.enum_keys().flatten() {
        let Ok(entry) = uninstall.open_subkey(&product_code) else {
            continue;
        };

        let name: String = match entry.get_value("DisplayName") {
            Ok(n) => n,
            Err(_) => continue,
        };
        let publisher = entry.get_value("Publisher").ok();
        let version = entry.get_value("DisplayVersion").ok();

        programs.push(InstalledProgram {
            name,
            program_type: ProgramType::Win32,
            publisher,
            version,
            architecture: None,
            package_name: None,
            product_code: Some(product_code),
            scope,
        });
    }

    programs
}

#[cfg(not(windows))]
fn scan_view(_view: RegistryView) -> Vec<InstalledProgram> {
    Vec::new()
}

const APPX_PACKAGES_PATH: &str =
    r"Software\Classes\Local Settings\Software\Microsoft\Windows\CurrentVersion\AppModel\Repository\Packages";

/// Enumerates installed AppX/MSIX packages from the per-user package
/// repository registry (the same `PackageFullName`-keyed hive
/// `Get-AppxPackage` itself reads from). This is package *enumeration*,
/// not the `Windows.Management.Deployment` install/remove surface spec.md
/// §1 excludes.
#[cfg(windows)]
fn scan_appx() -> Vec<InstalledProgram> {
    use winreg::enums::*;
    use winreg::RegKey;

    let Ok(packages) =
        RegKey::predef(HKEY_CURRENT_USER).open_subkey_with_flags(APPX_PACKAGES_PATH, KEY_READ)
    else {
        return Vec::new();
    };

    let mut programs = Vec::new();
    for package_full_name in packages.enum_keys().flatten() {
        let Ok(entry) = packages.open_subkey(&package_full_name) else {
            continue;
        };

        let parsed = crate::moniker::parse(&package_full_name);
        let display_name: Option<String> = entry.get_value("DisplayName").ok();
        let publisher: Option<String> = entry.get_value("PackagePublisher").ok();

        let name = display_name
            .or_else(|| parsed.as_ref().map(|m| m.name.clone()))
            .unwrap_or_else(|| package_full_name.clone());

        programs.push(InstalledProgram {
            name,
            program_type: ProgramType::Appx,
            publisher,
            version: parsed.as_ref().map(|m| m.version.clone()),
            architecture: parsed
                .as_ref()
                .and_then(|m| m.arch.parse::<Architecture>().ok()),
            package_name: parsed.as_ref().map(|m| m.name.clone()),
            product_code: Some(package_full_name),
            scope: Scope::User,
        });
    }

    programs
}

#[cfg(not(windows))]
fn scan_appx() -> Vec<InstalledProgram> {
    Vec::new()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn list_is_memoized() {
        let installed = InstalledPrograms::new(false);
        let first = installed.list();
        let second = installed.list();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn appx_inventory_filters_by_type() {
        let installed = InstalledPrograms::new(false);
        assert!(installed.appx_inventory().iter().all(|p| p.program_type == ProgramType::Appx));
    }

    #[test]
    fn appx_inventory_empty_when_not_requested() {
        let installed = InstalledPrograms::new(false);
        assert!(installed.appx_inventory().is_empty());
    }
}
