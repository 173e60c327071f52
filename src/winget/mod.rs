//! The WinGet offline catalog pipeline (C9 + C10): an independent pipeline
//! from the Store delivery components, sharing only the crate's error
//! taxonomy and HTTP plumbing.

pub mod catalog;
pub mod manifest;

pub use catalog::WingetCatalog;
pub use manifest::{PackageInstaller, WingetManifestFetcher};
