//! Built-in crypto library profiles

use tlsprobe_core::{ArgSpec, Direction};

/// One hooked entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookSpec {
    pub symbol: &'static str,
    pub direction: Direction,
    /// Buffer and length argument positions
    pub args: ArgSpec,
    /// A missing required hook fails init; a missing optional one is skipped
    pub required: bool,
}

impl HookSpec {
    pub const fn required(symbol: &'static str, direction: Direction) -> Self {
        Self {
            symbol,
            direction,
            args: ArgSpec::new(1, 2),
            required: true,
        }
    }

    pub const fn optional(symbol: &'static str, direction: Direction) -> Self {
        Self {
            symbol,
            direction,
            args: ArgSpec::new(1, 2),
            required: false,
        }
    }
}

/// How to find and hook one crypto library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryProfile {
    /// Module name, also the event tag
    pub name: &'static str,
    /// Prefix matched against `DT_NEEDED` entries of a hint binary
    pub soname_prefix: &'static str,
    /// File names probed in the search directories, most preferred first
    pub file_names: &'static [&'static str],
    /// Binary whose dependencies point at the library when no hint is configured
    pub default_hint: Option<&'static str>,
    /// Directories searched in addition to the system defaults
    pub extra_dirs: &'static [&'static str],
    pub hooks: &'static [HookSpec],
}

pub const OPENSSL: LibraryProfile = LibraryProfile {
    name: "openssl",
    soname_prefix: "libssl.so",
    file_names: &["libssl.so.3", "libssl.so.1.1", "libssl.so.1.0.0", "libssl.so"],
    default_hint: Some("/usr/bin/curl"),
    extra_dirs: &[],
    hooks: &[
        // SSL_write(SSL *ssl, const void *buf, int num)
        HookSpec::required("SSL_write", Direction::Write),
        // SSL_read(SSL *ssl, void *buf, int num)
        HookSpec::required("SSL_read", Direction::Read),
    ],
};

pub const GNUTLS: LibraryProfile = LibraryProfile {
    name: "gnutls",
    soname_prefix: "libgnutls.so",
    file_names: &["libgnutls.so.30", "libgnutls.so.28", "libgnutls.so"],
    default_hint: Some("/usr/bin/wget"),
    extra_dirs: &[],
    hooks: &[
        // gnutls_record_send(gnutls_session_t session, const void *data, size_t data_size)
        HookSpec::required("gnutls_record_send", Direction::Write),
        HookSpec::required("gnutls_record_recv", Direction::Read),
    ],
};

pub const NSPR: LibraryProfile = LibraryProfile {
    name: "nspr",
    soname_prefix: "libnspr4.so",
    file_names: &["libnspr4.so"],
    default_hint: Some("/usr/lib/firefox/firefox"),
    extra_dirs: &["/usr/lib/firefox", "/usr/lib64/firefox", "/opt/firefox"],
    hooks: &[
        // PR_Write(PRFileDesc *fd, const void *buf, PRInt32 amount)
        HookSpec::required("PR_Write", Direction::Write),
        HookSpec::required("PR_Read", Direction::Read),
        HookSpec::optional("PR_Send", Direction::Write),
        HookSpec::optional("PR_Recv", Direction::Read),
    ],
};

/// Every built-in profile, in default module order
pub const BUILTIN: &[LibraryProfile] = &[OPENSSL, GNUTLS, NSPR];

/// Built-in profile for a module name
pub fn profile(name: &str) -> Option<&'static LibraryProfile> {
    BUILTIN.iter().find(|p| p.name == name)
}
