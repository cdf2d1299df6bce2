//! Classification of encoder diagnostic output.
//!
//! Classes are checked in order (memory, upstream, generic) so a line
//! belongs to exactly one of them.

use std::sync::LazyLock;

use regex::RegexSet;

/// Class of one diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticClass {
    /// Allocation failure; fatal, not retried
    OutOfMemory,
    /// A source could not be reached or decoded; fatal, not retried
    Upstream,
    /// Error or warning text that does not stop the pipeline
    Generic,
    /// Progress output and banners
    Noise,
}

impl DiagnosticClass {
    pub fn is_fatal(self) -> bool {
        matches!(self, DiagnosticClass::OutOfMemory | DiagnosticClass::Upstream)
    }
}

static OUT_OF_MEMORY: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)cannot allocate memory",
        r"(?i)out of memory",
        r"(?i)\benomem\b",
        r"(?i)memory allocation failed",
        r"(?i)failed to allocate",
    ])
    .expect("memory patterns are valid")
});

static UPSTREAM: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)connection refused",
        r"(?i)connection timed out",
        r"(?i)operation timed out",
        r"(?i)connection reset by peer",
        r"(?i)no route to host",
        r"(?i)network is unreachable",
        r"(?i)could not find codec parameters",
        r"(?i)invalid data found when processing input",
        r"(?i)401 unauthorized",
        r"(?i)method (describe|setup) failed",
        r"(?i)server returned 4\d\d",
    ])
    .expect("upstream patterns are valid")
});

static GENERIC: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([r"(?i)\berror\b", r"(?i)\bwarning\b", r"(?i)\bfailed\b"])
        .expect("generic patterns are valid")
});

/// Classifies one line of encoder diagnostics.
pub fn classify(line: &str) -> DiagnosticClass {
    if OUT_OF_MEMORY.is_match(line) {
        DiagnosticClass::OutOfMemory
    } else if UPSTREAM.is_match(line) {
        DiagnosticClass::Upstream
    } else if GENERIC.is_match(line) {
        DiagnosticClass::Generic
    } else {
        DiagnosticClass::Noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_lines() {
        assert_eq!(
            classify("[h264 @ 0x55d] Cannot allocate memory"),
            DiagnosticClass::OutOfMemory
        );
        assert_eq!(
            classify("av_malloc: Out of memory"),
            DiagnosticClass::OutOfMemory
        );
    }

    #[test]
    fn test_upstream_lines() {
        assert_eq!(
            classify("[tcp @ 0x1] Connection to tcp://10.0.0.3:554 failed: Connection refused"),
            DiagnosticClass::Upstream
        );
        assert_eq!(
            classify("rtsp://cam3/main: Connection timed out"),
            DiagnosticClass::Upstream
        );
        assert_eq!(
            classify("Could not find codec parameters for stream 0 (Video: h264)"),
            DiagnosticClass::Upstream
        );
        assert_eq!(
            classify("rtsp://cam3: Invalid data found when processing input"),
            DiagnosticClass::Upstream
        );
        assert_eq!(
            classify("method DESCRIBE failed: 401 Unauthorized"),
            DiagnosticClass::Upstream
        );
    }

    #[test]
    fn test_memory_wins_over_generic() {
        let line = "Error while decoding: Cannot allocate memory";
        assert_eq!(classify(line), DiagnosticClass::OutOfMemory);
        assert!(classify(line).is_fatal());
    }

    #[test]
    fn test_generic_lines_are_not_fatal() {
        let class = classify("[h264 @ 0x2] error while decoding MB 12 7");
        assert_eq!(class, DiagnosticClass::Generic);
        assert!(!class.is_fatal());
        assert_eq!(
            classify("Warning: non monotonically increasing dts"),
            DiagnosticClass::Generic
        );
    }

    #[test]
    fn test_progress_lines_are_noise() {
        assert_eq!(
            classify("frame=  120 fps= 15 q=23.0 size=    1024kB time=00:00:08.00"),
            DiagnosticClass::Noise
        );
        assert_eq!(classify("  Stream #0:0: Video: h264"), DiagnosticClass::Noise);
    }
}
