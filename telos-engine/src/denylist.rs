/// Size of the kernel buffer the file name is read into, NUL included.
pub const MAX_FILE_NAME: usize = 32;

const MAX_FILE_NAME_BYTES: usize = MAX_FILE_NAME.saturating_sub(1);

/// One sensitive file name pattern, matched against the final path
/// component only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePattern<'a> {
    /// Name starts with the bytes (`id_` covers `id_rsa`, `id_ed25519`).
    Prefix(&'a [u8]),
    /// Name equals the bytes.
    Exact(&'a [u8]),
    /// Name ends with the bytes.
    Suffix(&'a [u8]),
}

impl FilePattern<'_> {
    /// Whether `name` matches. An empty pattern never matches.
    pub fn matches(&self, name: &[u8]) -> bool {
        match *self {
            FilePattern::Prefix(p) => !p.is_empty() && name.starts_with(p),
            FilePattern::Exact(p) => !p.is_empty() && name == p,
            FilePattern::Suffix(p) => !p.is_empty() && name.ends_with(p),
        }
    }
}

/// SSH private keys.
pub const DEFAULT_SENSITIVE_PATTERNS: &[FilePattern<'static>] = &[FilePattern::Prefix(b"id_")];

/// A borrowed, bounded list of sensitive file patterns.
#[derive(Debug, Clone, Copy)]
pub struct Denylist<'a> {
    patterns: &'a [FilePattern<'a>],
}

impl<'a> Denylist<'a> {
    /// Wrap a pattern slice.
    pub const fn new(patterns: &'a [FilePattern<'a>]) -> Self {
        Self { patterns }
    }

    /// Whether `name` matches any pattern.
    ///
    /// Names are truncated to the kernel read buffer first, so a pattern
    /// that only matches past byte 31 never fires in either host.
    pub fn matches(&self, name: &[u8]) -> bool {
        let name = &name[..name.len().min(MAX_FILE_NAME_BYTES)];
        self.patterns.iter().any(|p| p.matches(name))
    }
}

impl Default for Denylist<'static> {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_PATTERNS)
    }
}
