//! Guest-side shell command assembly.

use std::collections::HashMap;

use super::ShareBinding;
use crate::config::MountMode;

/// Tag the guest uses to mount the host-exported virtiofs device.
pub(crate) const SHARE_TAG: &str = "vibebox-shared";

/// Staging mountpoint for the share map inside the guest.
pub(crate) const SHARED_MOUNT_ROOT: &str = "/mnt/shared";

/// Single-quote a literal for the guest shell; inner quotes become `'\''`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Key-sorted `export K='V';` sequence with a trailing space, or empty.
/// Stable ordering keeps generated commands reproducible.
pub(crate) fn shell_exports(env: &HashMap<String, String>) -> String {
    if env.is_empty() {
        return String::new();
    }
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    let parts: Vec<String> = keys
        .iter()
        .map(|k| format!("export {}={};", k, shell_quote(&env[*k])))
        .collect();
    format!("{} ", parts.join(" "))
}

/// One compound command that mounts the virtiofs tag and bind-mounts every
/// share onto its guest path, remounting read-only shares accordingly.
pub(crate) fn build_guest_mount_command(bindings: &[ShareBinding]) -> String {
    let mut out = format!(
        "mkdir -p {root} && mount -t virtiofs {tag} {root}",
        root = shell_quote(SHARED_MOUNT_ROOT),
        tag = shell_quote(SHARE_TAG),
    );
    for binding in bindings {
        let staging = format!("{}/{}", SHARED_MOUNT_ROOT, binding.share_name);
        out.push_str(&format!(
            " && mkdir -p {guest} && mount --bind {staging} {guest}",
            guest = shell_quote(&binding.guest_path),
            staging = shell_quote(&staging),
        ));
        if binding.mode == MountMode::Ro {
            out.push_str(&format!(
                " && mount -o remount,ro,bind {}",
                shell_quote(&binding.guest_path)
            ));
        }
    }
    out
}

/// Heredoc the provision script into the guest and run it under bash with
/// poweroff suppressed. The delimiter grows until it no longer collides
/// with the script body.
pub(crate) fn build_provision_command(script: &str) -> String {
    let mut delimiter = String::from("__VIBEBOX_PROVISION_EOF__");
    while script.contains(&delimiter) {
        delimiter.push_str("_X");
    }

    let mut out = String::new();
    out.push_str("cat >/tmp/vibebox-provision.sh <<'");
    out.push_str(&delimiter);
    out.push_str("'\n");
    out.push_str(script);
    if !script.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&delimiter);
    out.push('\n');
    out.push_str("chmod +x /tmp/vibebox-provision.sh\n");
    out.push_str("VIBEBOX_PROVISION_POWEROFF=0 /bin/bash /tmp/vibebox-provision.sh\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_exports_sorted() {
        let mut env = HashMap::new();
        env.insert("ZED".to_string(), "last".to_string());
        env.insert("ALPHA".to_string(), "first".to_string());
        assert_eq!(
            shell_exports(&env),
            "export ALPHA='first'; export ZED='last'; "
        );
        assert_eq!(shell_exports(&HashMap::new()), "");
    }

    #[test]
    fn test_guest_mount_command() {
        let bindings = vec![
            ShareBinding {
                share_name: "share0".into(),
                guest_path: "/workspace".into(),
                mode: MountMode::Rw,
            },
            ShareBinding {
                share_name: "share1".into(),
                guest_path: "/data".into(),
                mode: MountMode::Ro,
            },
        ];
        let cmd = build_guest_mount_command(&bindings);
        assert!(cmd.starts_with("mkdir -p '/mnt/shared' && mount -t virtiofs 'vibebox-shared' '/mnt/shared'"));
        assert!(cmd.contains("mount --bind '/mnt/shared/share0' '/workspace'"));
        assert!(cmd.contains("mount --bind '/mnt/shared/share1' '/data'"));
        // Only the ro share gets remounted read-only.
        assert!(cmd.contains("mount -o remount,ro,bind '/data'"));
        assert!(!cmd.contains("remount,ro,bind '/workspace'"));
    }

    #[test]
    fn test_provision_heredoc() {
        let cmd = build_provision_command("apt-get update\napt-get install -y git");
        assert!(cmd.starts_with("cat >/tmp/vibebox-provision.sh <<'__VIBEBOX_PROVISION_EOF__'\n"));
        assert!(cmd.contains("apt-get install -y git\n__VIBEBOX_PROVISION_EOF__\n"));
        assert!(cmd.ends_with("VIBEBOX_PROVISION_POWEROFF=0 /bin/bash /tmp/vibebox-provision.sh\n"));
    }

    #[test]
    fn test_provision_delimiter_collision() {
        let script = "echo __VIBEBOX_PROVISION_EOF__";
        let cmd = build_provision_command(script);
        assert!(cmd.contains("<<'__VIBEBOX_PROVISION_EOF___X'"));
    }
}
