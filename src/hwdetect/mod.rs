// src/hwdetect/mod.rs

//! Hardware candidate enumeration and device-hint matching.
//!
//! The mount orchestrator asks a [`HardwareList`] for candidates of the
//! class a URL needs, then filters them against the user's device hint.
//! Hints match the short device name or any alternate name as a glob
//! pattern, or the hardware address case-insensitively.

use glob::Pattern;

use crate::url::Scheme;

/// Coarse device class a URL scheme can be served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareClass {
    Block,
    Cdrom,
    Floppy,
    Network,
}

impl HardwareClass {
    /// Class of hardware a scheme resolves against, if any. `file:` and
    /// pure download schemes without a device need none.
    pub fn for_scheme(scheme: Scheme) -> Option<HardwareClass> {
        Some(match scheme {
            Scheme::Cdrom | Scheme::Dvd => HardwareClass::Cdrom,
            Scheme::Floppy => HardwareClass::Floppy,
            Scheme::Hd | Scheme::Disk | Scheme::Exec => HardwareClass::Block,
            Scheme::Nfs
            | Scheme::Smb
            | Scheme::Http
            | Scheme::Https
            | Scheme::Ftp
            | Scheme::Tftp
            | Scheme::Slp => HardwareClass::Network,
            _ => return None,
        })
    }
}

/// One enumerated device.
#[derive(Debug, Clone, Default)]
pub struct DeviceCandidate {
    /// Full device path (`/dev/sda1`) or interface name (`eth0`).
    pub device: Option<String>,
    /// By-id / by-label style alternate names.
    pub alt_names: Vec<String>,
    pub hwaddr: Option<String>,
    pub model: Option<String>,
    pub unique_id: Option<String>,
    pub classes: Vec<HardwareClass>,
    /// Whole disk that carries a partition table.
    pub has_partitions: bool,
    pub is_wlan: bool,
}

impl DeviceCandidate {
    pub fn is_class(&self, class: HardwareClass) -> bool {
        self.classes.contains(&class)
    }
}

/// Enumerates devices of a class. The production implementation reads
/// the kernel's view of attached hardware; tests inject fixed lists.
pub trait HardwareList {
    fn list(&self, class: HardwareClass) -> Vec<DeviceCandidate>;
}

/// Does `hint` select this device? Globs match the short device name and
/// alternate names; a hint equal to the hardware address (ignoring case)
/// also matches.
pub fn device_matches(candidate: &DeviceCandidate, hint: &str) -> bool {
    let pattern = Pattern::new(hint).ok();

    if let Some(dev) = &candidate.device {
        let short = crate::url::short_dev(dev);
        if let Some(p) = &pattern {
            if p.matches(short) {
                return true;
            }
        } else if short == hint {
            return true;
        }
    }
    for alt in &candidate.alt_names {
        let short = crate::url::short_dev(alt);
        if let Some(p) = &pattern {
            if p.matches(short) {
                return true;
            }
        } else if short == hint {
            return true;
        }
    }
    if let Some(hwaddr) = &candidate.hwaddr {
        if hwaddr.eq_ignore_ascii_case(hint) {
            return true;
        }
    }
    false
}

/// Enumerate and filter candidates for a scheme. `hint` of `None`
/// matches everything of the right class; hd/disk additionally exclude
/// removable classes and whole disks with partition tables.
pub fn find_candidates(
    hardware: &dyn HardwareList,
    scheme: Scheme,
    hint: Option<&str>,
) -> Vec<DeviceCandidate> {
    let Some(class) = HardwareClass::for_scheme(scheme) else {
        return Vec::new();
    };

    let exclude_removable = matches!(scheme, Scheme::Hd | Scheme::Disk);

    hardware
        .list(class)
        .into_iter()
        .filter(|c| {
            if c.device.is_none() {
                return false;
            }
            if exclude_removable
                && (c.is_class(HardwareClass::Cdrom)
                    || c.is_class(HardwareClass::Floppy)
                    || c.has_partitions)
            {
                return false;
            }
            match hint {
                Some(hint) => device_matches(c, hint),
                None => true,
            }
        })
        .collect()
}

/// Hardware enumeration from sysfs.
pub struct SysHardware;

impl SysHardware {
    fn block_devices(&self) -> Vec<DeviceCandidate> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir("/sys/block") else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("dm-") {
                continue;
            }
            let sys = entry.path();
            let model = std::fs::read_to_string(sys.join("device/model"))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());

            let mut classes = vec![HardwareClass::Block];
            if name.starts_with("sr") {
                classes.push(HardwareClass::Cdrom);
            }
            if name.starts_with("fd") {
                classes.push(HardwareClass::Floppy);
            }

            // partitions show up as subdirectories named after the disk
            let mut partitions = Vec::new();
            if let Ok(subs) = std::fs::read_dir(&sys) {
                for sub in subs.flatten() {
                    let sub_name = sub.file_name().to_string_lossy().to_string();
                    if sub_name.starts_with(&name) && sub.path().join("partition").exists() {
                        partitions.push(sub_name);
                    }
                }
            }

            for part in &partitions {
                out.push(DeviceCandidate {
                    device: Some(format!("/dev/{part}")),
                    model: Some("Partition".to_string()),
                    classes: classes.clone(),
                    ..Default::default()
                });
            }
            out.push(DeviceCandidate {
                device: Some(format!("/dev/{name}")),
                model,
                classes,
                has_partitions: !partitions.is_empty(),
                ..Default::default()
            });
        }
        out
    }

    fn net_devices(&self) -> Vec<DeviceCandidate> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir("/sys/class/net") else {
            return out;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let sys = entry.path();
            let hwaddr = std::fs::read_to_string(sys.join("address"))
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s != "00:00:00:00:00:00");
            out.push(DeviceCandidate {
                device: Some(name),
                hwaddr,
                is_wlan: sys.join("wireless").exists(),
                classes: vec![HardwareClass::Network],
                ..Default::default()
            });
        }
        out
    }
}

impl HardwareList for SysHardware {
    fn list(&self, class: HardwareClass) -> Vec<DeviceCandidate> {
        let all = match class {
            HardwareClass::Network => self.net_devices(),
            _ => self.block_devices(),
        };
        all.into_iter().filter(|c| c.is_class(class)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(device: &str, classes: &[HardwareClass]) -> DeviceCandidate {
        DeviceCandidate {
            device: Some(device.to_string()),
            classes: classes.to_vec(),
            ..Default::default()
        }
    }

    struct FixedList(Vec<DeviceCandidate>);

    impl HardwareList for FixedList {
        fn list(&self, class: HardwareClass) -> Vec<DeviceCandidate> {
            self.0
                .iter()
                .filter(|c| c.is_class(class))
                .cloned()
                .collect()
        }
    }

    #[test]
    fn test_glob_hint_matches_short_name() {
        let c = cand("/dev/sda1", &[HardwareClass::Block]);
        assert!(device_matches(&c, "sda1"));
        assert!(device_matches(&c, "sd*"));
        assert!(!device_matches(&c, "sdb*"));
    }

    #[test]
    fn test_hint_matches_alt_names_and_hwaddr() {
        let mut c = cand("eth0", &[HardwareClass::Network]);
        c.alt_names.push("enp0s3".to_string());
        c.hwaddr = Some("00:11:22:33:44:55".to_string());
        assert!(device_matches(&c, "enp*"));
        assert!(device_matches(&c, "00:11:22:33:44:55"));
        assert!(device_matches(&c, "00:11:22:33:44:55".to_uppercase().as_str()));
        assert!(!device_matches(&c, "wlan0"));
    }

    #[test]
    fn test_disk_excludes_removable_and_partitioned() {
        let mut whole = cand("/dev/sda", &[HardwareClass::Block]);
        whole.has_partitions = true;
        let part = cand("/dev/sda1", &[HardwareClass::Block]);
        let cd = cand("/dev/sr0", &[HardwareClass::Block, HardwareClass::Cdrom]);
        let list = FixedList(vec![whole, part.clone(), cd.clone()]);

        let got = find_candidates(&list, Scheme::Disk, None);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].device, part.device);

        // cdrom scheme still sees the cd drive
        let got = find_candidates(&list, Scheme::Cdrom, None);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].device, cd.device);
    }

    #[test]
    fn test_no_hint_matches_all_of_class() {
        let list = FixedList(vec![
            cand("eth0", &[HardwareClass::Network]),
            cand("eth1", &[HardwareClass::Network]),
        ]);
        assert_eq!(find_candidates(&list, Scheme::Nfs, None).len(), 2);
        assert_eq!(find_candidates(&list, Scheme::Nfs, Some("eth1")).len(), 1);
    }

    #[test]
    fn test_candidate_without_device_is_skipped() {
        let mut c = DeviceCandidate::default();
        c.classes.push(HardwareClass::Network);
        let list = FixedList(vec![c]);
        assert!(find_candidates(&list, Scheme::Http, None).is_empty());
    }

    #[test]
    fn test_file_scheme_needs_no_hardware() {
        assert!(HardwareClass::for_scheme(Scheme::File).is_none());
        assert_eq!(
            HardwareClass::for_scheme(Scheme::Http),
            Some(HardwareClass::Network)
        );
    }
}
