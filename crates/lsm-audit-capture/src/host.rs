//! Host checks for loading the LSM programs

use serde::Serialize;
use std::path::Path;
use tracing::warn;

/// First kernel with `BPF_PROG_TYPE_LSM`
pub const MIN_KERNEL: (u32, u32, u32) = (5, 7, 0);

const BTF_VMLINUX: &str = "/sys/kernel/btf/vmlinux";
const BPF_FS: &str = "/sys/fs/bpf";
const ACTIVE_LSMS: &str = "/sys/kernel/security/lsm";
const OS_RELEASE: &str = "/proc/sys/kernel/osrelease";

/// What this host offers for BPF LSM capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub kernel: Option<(u32, u32, u32)>,
    pub root: bool,
    pub bpf_fs: bool,
    pub btf: bool,
    /// `None` when the active LSM list could not be read
    pub bpf_lsm: Option<bool>,
}

impl HostStatus {
    pub fn probe() -> Self {
        Self {
            kernel: get_kernel_version(),
            root: is_root(),
            bpf_fs: Path::new(BPF_FS).exists(),
            btf: Path::new(BTF_VMLINUX).exists(),
            bpf_lsm: std::fs::read_to_string(ACTIVE_LSMS)
                .ok()
                .map(|list| lsm_list_has_bpf(&list)),
        }
    }

    /// Reasons the LSM programs cannot be attached; empty when ready
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self.kernel {
            Some(version) if version < MIN_KERNEL => problems.push(format!(
                "kernel {}.{}.{} is older than {}.{}",
                version.0, version.1, version.2, MIN_KERNEL.0, MIN_KERNEL.1
            )),
            Some(_) => {}
            None => problems.push("kernel version unknown".to_string()),
        }
        if !self.root {
            problems.push("not running as root".to_string());
        }
        if !self.btf {
            problems.push(format!("BTF not available at {}", BTF_VMLINUX));
        }
        match self.bpf_lsm {
            Some(true) => {}
            Some(false) => {
                problems.push(
                    "\"bpf\" missing from the active LSM list (boot with lsm=...,bpf)".to_string(),
                )
            }
            None => problems.push(format!("cannot read {}", ACTIVE_LSMS)),
        }
        problems
    }

    pub fn is_ready(&self) -> bool {
        self.problems().is_empty()
    }
}

/// Check if the LSM programs can plausibly be attached, logging what is missing
pub fn check_lsm_available() -> bool {
    let status = HostStatus::probe();
    if !status.bpf_fs {
        warn!("BPF filesystem not mounted at {}", BPF_FS);
    }
    for problem in status.problems() {
        warn!("BPF LSM unavailable: {}", problem);
    }
    status.is_ready()
}

/// Kernel release of this host
pub fn get_kernel_version() -> Option<(u32, u32, u32)> {
    let release = std::fs::read_to_string(OS_RELEASE).ok()?;
    parse_kernel_version(&release)
}

/// Parse `major.minor[.patch][-suffix]`
pub fn parse_kernel_version(release: &str) -> Option<(u32, u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.split(['-', '+']).next()?.parse().ok()?;
    let patch = parts
        .next()
        .and_then(|p| p.split(['-', '+']).next())
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    Some((major, minor, patch))
}

/// Whether a `/sys/kernel/security/lsm` listing includes the BPF LSM
pub fn lsm_list_has_bpf(list: &str) -> bool {
    list.trim().split(',').any(|lsm| lsm.trim() == "bpf")
}

#[cfg(target_os = "linux")]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(target_os = "linux"))]
pub fn is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> HostStatus {
        HostStatus {
            kernel: Some((6, 8, 0)),
            root: true,
            bpf_fs: true,
            btf: true,
            bpf_lsm: Some(true),
        }
    }

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("6.8.0-45-generic\n"), Some((6, 8, 0)));
        assert_eq!(parse_kernel_version("5.15.153.1-microsoft-standard-WSL2"), Some((5, 15, 153)));
        assert_eq!(parse_kernel_version("6.1-rc3"), Some((6, 1, 0)));
        assert_eq!(parse_kernel_version("6.10.3+"), Some((6, 10, 3)));
        assert_eq!(parse_kernel_version("garbage"), None);
        assert_eq!(parse_kernel_version(""), None);
    }

    #[test]
    fn test_lsm_list() {
        assert!(lsm_list_has_bpf("lockdown,capability,landlock,yama,apparmor,bpf"));
        assert!(lsm_list_has_bpf("bpf\n"));
        assert!(!lsm_list_has_bpf("lockdown,capability,yama,apparmor"));
        assert!(!lsm_list_has_bpf("bpfilter"));
    }

    #[test]
    fn test_problems() {
        assert!(ready().is_ready());

        let old = HostStatus {
            kernel: Some((5, 4, 0)),
            ..ready()
        };
        assert_eq!(old.problems().len(), 1);
        assert!(old.problems()[0].contains("5.4.0"));

        let bare = HostStatus {
            kernel: None,
            root: false,
            bpf_fs: false,
            btf: false,
            bpf_lsm: Some(false),
        };
        assert_eq!(bare.problems().len(), 4);
    }
}
