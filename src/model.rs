//! Shared data types used across the Microsoft Store delivery pipeline
//! (C4-C8). WinGet (C9/C10) and MSI (C11) keep their own local types in
//! their own modules since they don't share a vocabulary with the Store
//! pipeline.

use crate::Error;
use std::fmt;
use std::str::FromStr;

/// CPU architecture, in the canonical lowercase form used by both the
/// Store catalogs and WinGet manifests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Architecture {
    X86,
    X64,
    Arm,
    Arm64,
    Neutral,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "x86" => Self::X86,
            "x64" | "x86_64" | "amd64" => Self::X64,
            "arm" => Self::Arm,
            "arm64" | "aarch64" => Self::Arm64,
            "neutral" => Self::Neutral,
            o => {
                return Err(Error::decode(
                    "architecture",
                    format!("unknown architecture '{o}'"),
                ))
            }
        })
    }
}

/// The kind of Store product a [`ProductId`] refers to, derived from its
/// length (spec.md §3, §4.9): 12 characters means MSIX/AppX served via
/// DisplayCatalog, 14+ means Win32 served via PackageManifests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AppType {
    MsixOrAppx,
    Win32,
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MsixOrAppx => "MSIX/AppX",
            Self::Win32 => "Win32",
        })
    }
}

/// A Store product identifier, case-normalized to upper and classified by
/// length into MSIX/AppX (12 chars) or Win32 (14+ chars).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductId(String);

impl ProductId {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.len() < 12 || !raw.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::decode(
                "product id",
                format!("'{raw}' is not 12+ alphanumeric characters"),
            ));
        }

        Ok(Self(raw.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 12 characters selects the MSIX/AppX (DisplayCatalog) path; 14+
    /// selects Win32 (PackageManifests).
    pub fn app_type(&self) -> AppType {
        if self.0.len() == 12 {
            AppType::MsixOrAppx
        } else {
            AppType::Win32
        }
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resolved, installable Store package after FE3 resolution, moniker
/// parsing, deduplication, and filtering (spec.md §3 `ResolvedPackage`).
#[derive(Clone, Debug, serde::Serialize)]
pub struct ResolvedPackage {
    pub update_id: uuid::Uuid,
    pub package_moniker: Option<String>,
    pub package_name: String,
    pub version: String,
    pub architecture: Option<Architecture>,
    pub publisher_id: Option<String>,
    pub file_name: String,
    pub size: Option<u64>,
    pub url: String,
    pub is_main_package: bool,
    pub package_rank: i32,
    pub installed: bool,
}

/// Either side of the Win32/MSIX split of a unified Store listing.
#[derive(Clone, Debug, serde::Serialize)]
pub enum DownloadInfo {
    Win32 {
        installer_url: String,
        sha256: Option<String>,
        silent_switches: String,
        architecture: Architecture,
        locale: Option<String>,
        scope: InstallScope,
        installer_type: String,
    },
    MsixOrAppx {
        packages: Vec<ResolvedPackage>,
        total_size: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum InstallScope {
    Machine,
    User,
    Unspecified,
}

/// The unified view produced by [`crate::pipeline::StorePipeline`] (spec.md
/// §3 `UnifiedStoreApp`). Exactly one of these is ever returned per call;
/// partial results are never emitted (spec.md §7).
#[derive(Clone, Debug, serde::Serialize)]
pub struct UnifiedStoreApp {
    pub product_id: ProductId,
    pub app_type: AppType,
    pub display_name: String,
    pub publisher: String,
    pub description: String,
    pub category: String,
    pub version: String,
    pub release_date: Option<chrono::DateTime<chrono::Utc>>,
    pub is_free: bool,
    pub price: Option<f64>,
    pub download_info: DownloadInfo,
}

impl serde::Serialize for ProductId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}
