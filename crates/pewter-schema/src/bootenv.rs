use crate::arch::supported_arch;
use crate::tmpl::TemplateInfo;
use crate::validation::Validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-architecture boot information for a boot environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchInfo {
    #[serde(default)]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initrds: Vec<String>,
    #[serde(default)]
    pub boot_params: String,
    #[serde(default)]
    pub iso_file: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub iso_url: String,
}

/// Operating system metadata for a boot environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub codename: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub iso_file: String,
    #[serde(default)]
    pub iso_sha256: String,
    #[serde(default)]
    pub iso_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub supported_architectures: BTreeMap<String, ArchInfo>,
}

/// A named OS + kernel + initrd bundle: everything the provisioner needs
/// to network-boot a machine into an installer or a live environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BootEnv {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub os: OsInfo,
    /// amd64 shorthand fields; folded into the per-arch map during
    /// validation.
    #[serde(default)]
    pub kernel: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initrds: Vec<String>,
    #[serde(default)]
    pub boot_params: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateInfo>,
    /// Applies to machines the system has never seen; such bootenvs
    /// render against an empty machine context.
    #[serde(default)]
    pub only_unknown: bool,
    #[serde(flatten)]
    pub validation: Validation,
}

impl BootEnv {
    /// Virtual-FS path for `file` under this bootenv's serving tree:
    /// `/<os-name>[/<arch>][/install]/<file>`, cleaned. The `arch`
    /// segment is omitted for amd64; the `install` segment appears when
    /// the bootenv name ends in `-install`.
    pub fn path_for(&self, file: &str, arch: &str) -> String {
        let mut parts: Vec<&str> = vec![self.os.name.as_str()];
        let canon = supported_arch(arch).unwrap_or(arch);
        if canon != "amd64" {
            parts.push(canon);
        }
        if self.name.ends_with("-install") {
            parts.push("install");
        }
        parts.push(file);
        clean_path(&parts)
    }
}

/// Join path segments under a leading slash, dropping empties and `.`
/// and resolving `..`, so templated file names cannot escape the tree.
fn clean_path(parts: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for part in parts {
        for seg in part.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    out.pop();
                }
                s => out.push(s),
            }
        }
    }
    let mut res = String::from("/");
    res.push_str(&out.join("/"));
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str, os: &str) -> BootEnv {
        BootEnv {
            name: name.to_owned(),
            os: OsInfo {
                name: os.to_owned(),
                ..OsInfo::default()
            },
            ..BootEnv::default()
        }
    }

    #[test]
    fn path_for_nondefault_arch_install() {
        let b = env("ubuntu-20.04-install", "ubuntu-20.04");
        assert_eq!(
            b.path_for("vmlinuz", "arm64"),
            "/ubuntu-20.04/arm64/install/vmlinuz"
        );
    }

    #[test]
    fn path_for_amd64_omits_arch() {
        let b = env("ubuntu-20.04-install", "ubuntu-20.04");
        assert_eq!(
            b.path_for("vmlinuz", "amd64"),
            "/ubuntu-20.04/install/vmlinuz"
        );
    }

    #[test]
    fn path_for_empty_file_is_tree_root() {
        let b = env("centos-8", "centos-8");
        assert_eq!(b.path_for("", "aarch64"), "/centos-8/arm64");
    }

    #[test]
    fn path_for_cleans_traversal() {
        let b = env("ubuntu", "ubuntu");
        assert_eq!(b.path_for("../../etc/passwd", "amd64"), "/etc/passwd");
    }

    #[test]
    fn serde_defaults_tolerate_sparse_json() {
        let b: BootEnv = serde_json::from_str(r#"{"name":"sparse"}"#).unwrap();
        assert_eq!(b.name, "sparse");
        assert!(b.templates.is_empty());
        assert!(!b.validation.validated);
    }
}
