use std::fs;

use crate::error::TraceError;

const PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";
const CAP_SYS_PTRACE: u32 = 19;

/// Check that this process may trace its own children.
pub fn check() -> Result<(), TraceError> {
    let scope = match fs::read_to_string(PTRACE_SCOPE) {
        Ok(contents) => parse_scope(&contents),
        // no Yama
        Err(_) => return Ok(()),
    };
    let effective = fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| effective_caps(&status));
    evaluate(scope, effective)
}

fn evaluate(scope: Option<u8>, effective: Option<u64>) -> Result<(), TraceError> {
    match scope {
        None | Some(0) | Some(1) => Ok(()),
        Some(2) => {
            if effective.is_some_and(|caps| caps & (1 << CAP_SYS_PTRACE) != 0) {
                Ok(())
            } else {
                Err(TraceError::NotPermitted(format!(
                    "{} is 2 and CAP_SYS_PTRACE is missing",
                    PTRACE_SCOPE
                )))
            }
        }
        Some(scope) => Err(TraceError::NotPermitted(format!(
            "{} is {}, ptrace is disabled",
            PTRACE_SCOPE, scope
        ))),
    }
}

fn parse_scope(contents: &str) -> Option<u8> {
    contents.trim().parse().ok()
}

fn effective_caps(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_caps() {
        let status = "Name:\tgraftlink\nCapInh:\t0000000000000000\nCapEff:\t0000000000080000\n";
        assert_eq!(effective_caps(status), Some(1 << CAP_SYS_PTRACE));
        assert_eq!(effective_caps("Name:\tx\n"), None);
    }

    #[test]
    fn test_scope_rules() {
        assert!(evaluate(None, None).is_ok());
        assert!(evaluate(parse_scope("1\n"), Some(0)).is_ok());
        assert!(evaluate(Some(2), Some(0)).is_err());
        assert!(evaluate(Some(2), Some(1 << CAP_SYS_PTRACE)).is_ok());
        assert!(evaluate(Some(3), Some(u64::MAX)).is_err());
    }
}
