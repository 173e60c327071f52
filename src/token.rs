//! C2: acquisition and caching of the MSA Device Token required to
//! authenticate FE3 SOAP calls.
//!
//! The only way to mint a fresh token is to read it out of another user's
//! registry hive, which requires administrator (or SYSTEM) privileges. This
//! module is deliberately soft-failing end to end: every acquisition step is
//! best-effort, and `get()` always returns *something* syntactically valid
//! even when every privileged step is unavailable, per spec.md §4.2.

use crate::{Error, Path, PathBuf};
use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Registry paths consulted as a last-resort, non-elevated source of a
/// device token before falling back to the hard-coded constant.
const STORE_CLIENT_SERVICE_TOKEN_PATH: &str =
    r"SOFTWARE\Microsoft\Windows\CurrentVersion\AppModel\StoreClient";
const STORE_CLIENT_SERVICE_TOKEN_VALUE: &str = "ServiceToken";
const WU_ORCHESTRATOR_TOKEN_PATH: &str =
    r"SOFTWARE\Microsoft\WindowsUpdate\Orchestrator\UpdateStore";
const WU_ORCHESTRATOR_TOKEN_VALUE: &str = "TokenData";

/// Used when no real token can be obtained by any means. Still matches the
/// `<Device>...</Device>` shape every caller validates against.
const FALLBACK_TOKEN: &str = "<Device>AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=</Device>";

const MARKER_POLL_TIMEOUT: Duration = Duration::from_secs(20);
const MARKER_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^<Device>.+</Device>$").expect("valid regex"))
}

/// An opaque, already-validated device token, ready to attach to a SOAP
/// request or cache to disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceToken(String);

impl DeviceToken {
    fn wrap(inner_base64: &str) -> Self {
        Self(format!("<Device>{inner_base64}</Device>"))
    }

    fn from_cached(raw: String) -> Option<Self> {
        token_regex().is_match(&raw).then_some(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fallback() -> Self {
        Self(FALLBACK_TOKEN.to_string())
    }
}

impl std::fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flags controlling a single [`DeviceTokenProvider::get`] call.
#[derive(Copy, Clone, Debug, Default)]
pub struct GetOptions {
    pub elevate_if_needed: bool,
    pub skip_cache: bool,
}

/// Acquires, caches, and refreshes the device token per the ordered
/// acquisition chain in spec.md §4.2.
pub struct DeviceTokenProvider {
    cache_path: PathBuf,
}

impl DeviceTokenProvider {
    pub fn new(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            cache_path: cache_path.into(),
        }
    }

    /// Runs the full acquisition chain, returning the first valid token
    /// found. Never errors: the hard-coded fallback is the floor.
    pub fn get(&self, opts: GetOptions) -> DeviceToken {
        if !opts.skip_cache {
            if let Some(token) = self.read_cache() {
                return token;
            }
        }

        if let Some(token) = extract::run_elevated(opts.elevate_if_needed, MARKER_POLL_TIMEOUT) {
            self.write_cache(&token);
            return token;
        }

        if let Some(token) = registry_fallback::read() {
            self.write_cache(&token);
            return token;
        }

        DeviceToken::fallback()
    }

    /// Equivalent to `get` with `SkipCache` set.
    pub fn refresh(&self) -> DeviceToken {
        self.get(GetOptions {
            elevate_if_needed: true,
            skip_cache: true,
        })
    }

    fn read_cache(&self) -> Option<DeviceToken> {
        let raw = std::fs::read_to_string(&self.cache_path).ok()?;
        DeviceToken::from_cached(raw)
    }

    fn write_cache(&self, token: &DeviceToken) {
        if let Some(parent) = self.cache_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if std::fs::write(&self.cache_path, token.as_str()).is_ok() {
            set_world_readable(&self.cache_path);
        }
    }
}

#[cfg(unix)]
fn set_world_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o644);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_world_readable(_path: &Path) {}

/// Non-Windows (or non-elevated) fallback: two well-known per-machine
/// registry reads, no elevation required. This is step 4 of the chain and
/// is the only registry path this crate ever attempts without SYSTEM
/// privileges.
#[cfg(windows)]
mod registry_fallback {
    use super::DeviceToken;
    use winreg::enums::*;
    use winreg::RegKey;

    pub fn read() -> Option<DeviceToken> {
        read_value(
            HKEY_LOCAL_MACHINE,
            super::STORE_CLIENT_SERVICE_TOKEN_PATH,
            super::STORE_CLIENT_SERVICE_TOKEN_VALUE,
        )
        .or_else(|| {
            read_value(
                HKEY_LOCAL_MACHINE,
                super::WU_ORCHESTRATOR_TOKEN_PATH,
                super::WU_ORCHESTRATOR_TOKEN_VALUE,
            )
        })
    }

    fn read_value(hive: isize, path: &str, value: &str) -> Option<DeviceToken> {
        let key = RegKey::predef(hive).open_subkey(path).ok()?;
        let raw: String = key.get_value(value).ok()?;
        Some(DeviceToken::wrap(raw.trim()))
    }
}

#[cfg(not(windows))]
mod registry_fallback {
    use super::DeviceToken;

    pub fn read() -> Option<DeviceToken> {
        None
    }
}

/// Step 2/3 of the acquisition chain: spawning an elevated helper (or
/// running directly, if already SYSTEM/admin) to pull the token out of the
/// SYSTEM user's `IdentityCRL` registry hive.
#[cfg(windows)]
mod extract {
    use super::DeviceToken;
    use std::time::{Duration, Instant};
    use winreg::enums::*;
    use winreg::RegKey;

    const TOKEN_KEY_PATH: &str =
        r"S-1-5-18\SOFTWARE\Microsoft\IdentityCRL\Immersive\production\Token";
    const VALIDATION_SUBSTRING: &str = "ztd.dds.microsoft.com";
    const HEADER_LEN: usize = 4;

    /// Runs the extraction in-process if we already have administrator
    /// capability; otherwise, if `elevate_if_needed`, launches a hidden
    /// elevated helper and polls for its marker file. Returns `None` if
    /// neither path yields a valid ticket within `timeout`.
    pub fn run_elevated(elevate_if_needed: bool, timeout: Duration) -> Option<DeviceToken> {
        if is_elevated() {
            return extract_from_hive();
        }

        if !elevate_if_needed {
            return None;
        }

        let marker = std::env::temp_dir().join("msappkit-device-token.marker");
        let _ = std::fs::remove_file(&marker);
        spawn_elevated_helper(&marker);

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Ok(raw) = std::fs::read_to_string(&marker) {
                let _ = std::fs::remove_file(&marker);
                return DeviceToken::from_cached(raw);
            }
            std::thread::sleep(super::MARKER_POLL_INTERVAL);
        }

        None
    }

    fn is_elevated() -> bool {
        // A non-elevated process cannot open HKEY_USERS\S-1-5-18; probing
        // that is a cheap, accurate proxy for "do we have the rights this
        // extraction needs".
        RegKey::predef(HKEY_USERS)
            .open_subkey(r"S-1-5-18")
            .is_ok()
    }

    fn spawn_elevated_helper(marker: &std::path::Path) {
        // Re-invoke this same binary with a hidden, elevated helper verb so
        // it can write the marker file from a SYSTEM/admin context. The
        // concrete elevation primitive (scheduled task vs. `runas`) is a
        // deployment detail left to the caller's packaging; here we just
        // shell out and let it fail silently if unavailable.
        if let Ok(exe) = std::env::current_exe() {
            let _ = std::process::Command::new(exe)
                .arg("--internal-extract-device-token")
                .arg(marker)
                .status();
        }
    }

    fn extract_from_hive() -> Option<DeviceToken> {
        let hku = RegKey::predef(HKEY_USERS);
        let token_key = hku.open_subkey(TOKEN_KEY_PATH).ok()?;

        for name in token_key.enum_keys().flatten() {
            let Ok(sub) = token_key.open_subkey(&name) else {
                continue;
            };
            let Ok(blob): Result<Vec<u8>, _> = sub.get_raw_value("DeviceTicket").map(|v| v.bytes)
            else {
                continue;
            };
            if blob.len() <= HEADER_LEN {
                continue;
            }
            let stripped = &blob[HEADER_LEN..];

            let Some(plaintext) = dpapi_unprotect(stripped) else {
                continue;
            };
            let decoded = String::from_utf16_lossy(
                &plaintext
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect::<Vec<u16>>(),
            );
            if !decoded.contains(VALIDATION_SUBSTRING) {
                continue;
            }

            use base64::Engine as _;
            let b64 = base64::engine::general_purpose::STANDARD.encode(stripped);
            return Some(DeviceToken::wrap(&b64));
        }

        None
    }

    fn dpapi_unprotect(blob: &[u8]) -> Option<Vec<u8>> {
        use windows::Win32::Security::Cryptography::{
            CryptUnprotectData, CRYPTPROTECT_LOCAL_MACHINE, CRYPT_INTEGER_BLOB,
        };

        let mut input = CRYPT_INTEGER_BLOB {
            cbData: blob.len() as u32,
            pbData: blob.as_ptr() as *mut u8,
        };
        let mut output = CRYPT_INTEGER_BLOB::default();

        // SAFETY: `input` points at `blob`, which outlives this call;
        // `output` is zero-initialized and freed via LocalFree below.
        let ok = unsafe {
            CryptUnprotectData(
                &mut input,
                None,
                None,
                None,
                None,
                CRYPTPROTECT_LOCAL_MACHINE,
                &mut output,
            )
        };

        if ok.is_err() || output.pbData.is_null() {
            return None;
        }

        // SAFETY: CryptUnprotectData succeeded and populated `output` with
        // `cbData` bytes at `pbData`, allocated by LocalAlloc.
        let result = unsafe {
            std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec()
        };

        unsafe {
            let _ = windows::Win32::Foundation::HLOCAL(output.pbData as isize);
            windows::Win32::System::Memory::LocalFree(windows::Win32::Foundation::HLOCAL(
                output.pbData as isize,
            ));
        }

        Some(result)
    }
}

#[cfg(not(windows))]
mod extract {
    use super::DeviceToken;
    use std::time::Duration;

    pub fn run_elevated(_elevate_if_needed: bool, _timeout: Duration) -> Option<DeviceToken> {
        None
    }
}

impl Error {
    pub(crate) fn auth_token(reason: impl Into<String>) -> Self {
        Self::AuthToken {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fallback_always_valid() {
        let token = DeviceToken::fallback();
        assert!(token_regex().is_match(token.as_str()));
    }

    #[test]
    fn cache_round_trip() {
        let dir = tempdir().unwrap();
        let cache_path = PathBuf::from_path_buf(dir.path().join("token.cache")).unwrap();
        let provider = DeviceTokenProvider::new(cache_path.clone());

        let token = DeviceToken::wrap("Zm9v");
        provider.write_cache(&token);

        let reread = provider.read_cache().expect("cache should round-trip");
        assert_eq!(reread, token);
    }

    #[test]
    fn invalid_cache_contents_are_rejected() {
        let dir = tempdir().unwrap();
        let cache_path = PathBuf::from_path_buf(dir.path().join("token.cache")).unwrap();
        std::fs::write(&cache_path, "not a device token").unwrap();

        let provider = DeviceTokenProvider::new(cache_path);
        assert!(provider.read_cache().is_none());
    }

    #[test]
    fn get_without_privileges_falls_back_to_constant() {
        let dir = tempdir().unwrap();
        let cache_path = PathBuf::from_path_buf(dir.path().join("missing.cache")).unwrap();
        let provider = DeviceTokenProvider::new(cache_path);

        let token = provider.get(GetOptions {
            elevate_if_needed: false,
            skip_cache: true,
        });
        assert!(token_regex().is_match(token.as_str()));
    }
}
