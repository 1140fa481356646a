use serde::{Deserialize, Serialize};

/// An external package repository, decoded from the global profile's
/// `package-repositories` parameter. A repo with `install_source` set
/// can stand in for a locally exploded ISO.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub install_source: bool,
    /// Where netboot artifacts (kernel/initrd) live when they are not
    /// under the repo's package tree.
    #[serde(default)]
    pub boot_loc: String,
    #[serde(default)]
    pub distribution: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<String>,
}

impl Repo {
    /// Whether this repo can serve as the install source for the given
    /// OS name.
    pub fn install_source_for(&self, os_name: &str) -> bool {
        self.install_source && self.os.len() == 1 && self.os[0] == os_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_source_requires_single_matching_os() {
        let mut r = Repo {
            install_source: true,
            os: vec!["ubuntu".to_owned()],
            ..Repo::default()
        };
        assert!(r.install_source_for("ubuntu"));
        assert!(!r.install_source_for("centos"));
        r.os.push("debian".to_owned());
        assert!(!r.install_source_for("ubuntu"));
        r.os.truncate(1);
        r.install_source = false;
        assert!(!r.install_source_for("ubuntu"));
    }
}
