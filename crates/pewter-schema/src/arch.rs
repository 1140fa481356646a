//! Architecture name canonicalization.
//!
//! Boot environments may declare architectures under several aliases
//! (`x86_64` vs `amd64`, `aarch64` vs `arm64`); everything downstream
//! works on the canonical name.

/// Canonicalize an architecture name. Returns `None` for names the
/// engine does not know how to boot.
pub fn supported_arch(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "amd64" | "x86_64" => Some("amd64"),
        "i386" | "x86" | "386" => Some("386"),
        "arm64" | "aarch64" => Some("arm64"),
        "arm" | "armhf" | "armv7l" => Some("arm"),
        "ppc64le" => Some("ppc64le"),
        "s390x" => Some("s390x"),
        "riscv64" => Some("riscv64"),
        _ => None,
    }
}

/// Whether two names refer to the same canonical architecture.
pub fn arch_equal(a: &str, b: &str) -> bool {
    match (supported_arch(a), supported_arch(b)) {
        (Some(ca), Some(cb)) => ca == cb,
        _ => a == b,
    }
}
