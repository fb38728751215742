//! Unix to Windows path translation
//!
//! A writer running on a Windows host sees the data directory through a mapped
//! drive or a UNC share. Paths under the Unix mount point are rewritten onto that
//! drive (`X:\scan\file.h5`) or share (`\\dc\data\scan\file.h5`).

use crate::error::{ScanError, ScanResult};
use crate::info::PathTranslation;

/// Rewrite `path` for the writer host, or return it unchanged without a translation.
pub fn translate(path: &str, translation: Option<&PathTranslation>) -> ScanResult<String> {
    let Some(t) = translation else {
        return Ok(path.to_string());
    };
    let mount = t.mount_unix.trim_end_matches('/');
    let rest = path.strip_prefix(mount).filter(|rest| rest.is_empty() || rest.starts_with('/'));
    let Some(rest) = rest else {
        return Err(ScanError::Configuration(format!(
            "'{path}' is not under the writer mount '{}'",
            t.mount_unix
        )));
    };
    let prefix = if t.network_prefix.is_empty() {
        t.drive.trim_end_matches(['\\', '/'])
    } else {
        t.network_prefix.trim_end_matches(['\\', '/'])
    };
    let rest = rest.replace('/', "\\");
    if rest.is_empty() {
        Ok(format!("{prefix}\\"))
    } else {
        Ok(format!("{prefix}{rest}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translation(network_prefix: &str) -> PathTranslation {
        PathTranslation {
            drive: "X:".into(),
            mount_unix: "/dls/p45".into(),
            network_prefix: network_prefix.into(),
        }
    }

    #[test]
    fn drive_letter_translation() {
        let t = translation("");
        assert_eq!(translate("/dls/p45/data/scan1", Some(&t)).unwrap(), "X:\\data\\scan1");
        assert_eq!(translate("/dls/p45", Some(&t)).unwrap(), "X:\\");
    }

    #[test]
    fn network_prefix_wins_over_drive() {
        let t = translation("\\\\dc\\data");
        assert_eq!(
            translate("/dls/p45/data/scan1", Some(&t)).unwrap(),
            "\\\\dc\\data\\data\\scan1"
        );
    }

    #[test]
    fn paths_outside_the_mount_are_rejected() {
        let t = translation("");
        assert!(translate("/dls/p451/data", Some(&t)).is_err());
        assert!(translate("/tmp/data", Some(&t)).is_err());
        assert_eq!(translate("/tmp/data", None).unwrap(), "/tmp/data");
    }
}
