use core::fmt;
use core::str::FromStr;

/// How compromised a process is believed to be.
///
/// Levels are totally ordered and always compared numerically. The
/// discriminants are the values stored in the kernel tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u32)]
pub enum TaintLevel {
    /// No untrusted input observed.
    #[default]
    Clean = 0,
    /// Untrusted input observed, nothing suspicious.
    Low = 1,
    /// Suspicious content observed.
    Medium = 2,
    /// Likely prompt injection or hostile content.
    High = 3,
    /// Confirmed hostile control of the process.
    Critical = 4,
}

impl TaintLevel {
    /// All levels in ascending order.
    pub const ALL: [TaintLevel; 5] = [
        TaintLevel::Clean,
        TaintLevel::Low,
        TaintLevel::Medium,
        TaintLevel::High,
        TaintLevel::Critical,
    ];

    /// Strict conversion from the stored integer. Returns `None` above 4.
    pub const fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(TaintLevel::Clean),
            1 => Some(TaintLevel::Low),
            2 => Some(TaintLevel::Medium),
            3 => Some(TaintLevel::High),
            4 => Some(TaintLevel::Critical),
            _ => None,
        }
    }

    /// Lenient conversion for values read back from shared tables.
    ///
    /// Anything above `Critical` saturates to `Critical`: a foreign writer
    /// that stored an out-of-range level meant "worse than we can name".
    pub const fn from_raw(raw: u32) -> Self {
        match Self::from_u32(raw) {
            Some(level) => level,
            None => TaintLevel::Critical,
        }
    }

    /// The stored integer form.
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Upper-case name as used on the wire and in logs.
    pub const fn name(self) -> &'static str {
        match self {
            TaintLevel::Clean => "CLEAN",
            TaintLevel::Low => "LOW",
            TaintLevel::Medium => "MEDIUM",
            TaintLevel::High => "HIGH",
            TaintLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for TaintLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a string names no taint level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseTaintLevelError;

impl fmt::Display for ParseTaintLevelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected CLEAN, LOW, MEDIUM, HIGH, CRITICAL or 0-4")
    }
}

impl core::error::Error for ParseTaintLevelError {}

impl FromStr for TaintLevel {
    type Err = ParseTaintLevelError;

    /// Accepts a level name (any case) or its numeric form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(raw) = s.parse::<u32>() {
            return Self::from_u32(raw).ok_or(ParseTaintLevelError);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.name().eq_ignore_ascii_case(s))
            .ok_or(ParseTaintLevelError)
    }
}
