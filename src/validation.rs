//! Input validation for security-critical request fields.
//!
//! All user-provided values that end up in shell commands, pod specs, or
//! label selectors MUST pass through this module. Validators are exact about
//! the accepted grammar so that rejected input never reaches the cluster.

use crate::error::{Error, Result};

/// Security levels accepted on sandboxes and warm pools.
pub const SECURITY_LEVELS: &[&str] = &["standard", "high", "custom"];

/// Maximum sandbox execution timeout in seconds.
pub const MAX_TIMEOUT_SECS: i32 = 3600;

/// Characters that would let a package name escape its shell context.
const PACKAGE_FORBIDDEN: &[char] = &[';', '&', '|', '>', '<', '$', '`', '\\', '"', '\''];

/// Validate a runtime identifier of the form `language:major.minor[.patch]`,
/// e.g. `python:3.10` or `node:20.11.1`.
pub fn validate_runtime(runtime: &str) -> Result<()> {
    if runtime.is_empty() {
        return Err(Error::validation("runtime cannot be empty"));
    }

    let Some((language, version)) = runtime.split_once(':') else {
        return Err(Error::validation(format!(
            "runtime {runtime:?} must be of the form language:version"
        )));
    };

    if language.is_empty()
        || !language
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(Error::validation(format!(
            "runtime language {language:?} must be lowercase alphanumeric"
        )));
    }

    let segments: Vec<&str> = version.split('.').collect();
    if segments.len() < 2 || segments.len() > 3 {
        return Err(Error::validation(format!(
            "runtime version {version:?} must be major.minor or major.minor.patch"
        )));
    }
    for segment in &segments {
        if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::validation(format!(
                "runtime version {version:?} contains a non-numeric segment"
            )));
        }
    }

    Ok(())
}

/// Validate a security level against the allowed set.
pub fn validate_security_level(level: &str) -> Result<()> {
    if SECURITY_LEVELS.contains(&level) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "security level {level:?} must be one of: {}",
            SECURITY_LEVELS.join(", ")
        )))
    }
}

/// Validate an execution timeout. Zero means "use the server default".
pub fn validate_timeout(timeout: i32) -> Result<()> {
    if (0..=MAX_TIMEOUT_SECS).contains(&timeout) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "timeout {timeout} must be between 0 and {MAX_TIMEOUT_SECS} seconds"
        )))
    }
}

/// Validate a CPU quantity: either millicores (`500m`) or cores (`2`, `0.5`).
pub fn validate_cpu(cpu: &str) -> Result<()> {
    let invalid = || Error::validation(format!("cpu {cpu:?} must be like \"500m\" or \"0.5\""));

    if cpu.is_empty() {
        return Err(invalid());
    }

    if let Some(millis) = cpu.strip_suffix('m') {
        if millis.is_empty() || !millis.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        return Ok(());
    }

    let mut dots = 0;
    for (i, c) in cpu.chars().enumerate() {
        match c {
            '0'..='9' => {}
            '.' if i > 0 && i < cpu.len() - 1 => {
                dots += 1;
                if dots > 1 {
                    return Err(invalid());
                }
            }
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

/// Validate a memory quantity: digits followed by `Ki`, `Mi`, or `Gi`.
pub fn validate_memory(memory: &str) -> Result<()> {
    let invalid =
        || Error::validation(format!("memory {memory:?} must be like \"512Mi\" or \"2Gi\""));

    let digits = memory
        .strip_suffix("Ki")
        .or_else(|| memory.strip_suffix("Mi"))
        .or_else(|| memory.strip_suffix("Gi"))
        .ok_or_else(invalid)?;

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    Ok(())
}

/// Validate an egress domain: DNS labels of alphanumerics and hyphens joined
/// by dots, optionally led by a `*.` wildcard. Domains are advisory metadata
/// (filtering is by port), but a malformed one is still a client error.
pub fn validate_domain(domain: &str) -> Result<()> {
    let invalid = || Error::validation(format!("egress domain {domain:?} is not a valid hostname"));

    if domain.is_empty() || domain.len() > 253 {
        return Err(invalid());
    }

    let rest = domain.strip_prefix("*.").unwrap_or(domain);
    if rest.is_empty() {
        return Err(invalid());
    }

    for label in rest.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid());
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Validate a network port number.
pub fn validate_port(port: i32) -> Result<()> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "port {port} must be between 1 and 65535"
        )))
    }
}

/// Validate an egress protocol.
pub fn validate_protocol(protocol: &str) -> Result<()> {
    match protocol {
        "TCP" | "UDP" => Ok(()),
        _ => Err(Error::validation(format!(
            "protocol {protocol:?} must be TCP or UDP"
        ))),
    }
}

/// Validate a package name for install-packages requests.
///
/// Rejects shell metacharacters outright; the name is interpolated into a
/// package-manager command line inside the sandbox.
pub fn validate_package_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("package name cannot be empty"));
    }
    if name.len() > 214 {
        return Err(Error::validation(format!(
            "package name {name:?} is too long"
        )));
    }
    for c in name.chars() {
        if PACKAGE_FORBIDDEN.contains(&c) || c.is_whitespace() || c.is_control() {
            return Err(Error::validation(format!(
                "package name {name:?} contains forbidden character {c:?}"
            )));
        }
    }
    Ok(())
}

/// Validate an in-sandbox file path: absolute, no parent traversal, and no
/// characters that could break out of the single-quoted shell context the
/// file proxy uses.
pub fn validate_sandbox_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::validation("path cannot be empty"));
    }
    if !path.starts_with('/') {
        return Err(Error::validation(format!("path {path:?} must be absolute")));
    }
    if path.split('/').any(|c| c == "..") {
        return Err(Error::validation(format!(
            "path {path:?} cannot contain parent directory references"
        )));
    }
    for c in ['\'', '\n', '\r', '\0', '`', '$'] {
        if path.contains(c) {
            return Err(Error::validation(format!(
                "path {path:?} contains forbidden character {c:?}"
            )));
        }
    }
    Ok(())
}

/// Sanitize a runtime identifier into a label value: `python:3.10` becomes
/// `python-3.10`. Label values must be alphanumeric plus `-`, `_`, `.`.
pub fn sanitize_runtime_label(runtime: &str) -> String {
    runtime
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_runtimes() {
        assert!(validate_runtime("python:3.10").is_ok());
        assert!(validate_runtime("python:3.10.12").is_ok());
        assert!(validate_runtime("node:20.11").is_ok());
        assert!(validate_runtime("go:1.22").is_ok());
    }

    #[test]
    fn test_invalid_runtimes() {
        assert!(validate_runtime("").is_err());
        assert!(validate_runtime("python").is_err());
        assert!(validate_runtime("python:3").is_err());
        assert!(validate_runtime("python:3.10.1.2").is_err());
        assert!(validate_runtime("Python:3.10").is_err());
        assert!(validate_runtime("python:3.x").is_err());
        assert!(validate_runtime("python:.10").is_err());
        assert!(validate_runtime("python:3.10; rm -rf /").is_err());
        assert!(validate_runtime("../etc:1.0").is_err());
    }

    #[test]
    fn test_security_levels() {
        assert!(validate_security_level("standard").is_ok());
        assert!(validate_security_level("high").is_ok());
        assert!(validate_security_level("custom").is_ok());
        assert!(validate_security_level("permissive").is_err());
        assert!(validate_security_level("").is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        assert!(validate_timeout(0).is_ok());
        assert!(validate_timeout(30).is_ok());
        assert!(validate_timeout(3600).is_ok());
        assert!(validate_timeout(3601).is_err());
        assert!(validate_timeout(-1).is_err());
    }

    #[test]
    fn test_cpu_quantities() {
        assert!(validate_cpu("500m").is_ok());
        assert!(validate_cpu("1").is_ok());
        assert!(validate_cpu("0.5").is_ok());
        assert!(validate_cpu("2.25").is_ok());

        assert!(validate_cpu("").is_err());
        assert!(validate_cpu("m").is_err());
        assert!(validate_cpu("500n").is_err());
        assert!(validate_cpu("1.").is_err());
        assert!(validate_cpu(".5").is_err());
        assert!(validate_cpu("1.2.3").is_err());
        assert!(validate_cpu("-1").is_err());
    }

    #[test]
    fn test_memory_quantities() {
        assert!(validate_memory("512Mi").is_ok());
        assert!(validate_memory("2Gi").is_ok());
        assert!(validate_memory("1024Ki").is_ok());

        assert!(validate_memory("").is_err());
        assert!(validate_memory("512").is_err());
        assert!(validate_memory("512M").is_err());
        assert!(validate_memory("512mi").is_err());
        assert!(validate_memory("Gi").is_err());
        assert!(validate_memory("1.5Gi").is_err());
    }

    #[test]
    fn test_domains() {
        assert!(validate_domain("pypi.org").is_ok());
        assert!(validate_domain("files.pythonhosted.org").is_ok());
        assert!(validate_domain("*.npmjs.org").is_ok());

        assert!(validate_domain("").is_err());
        assert!(validate_domain("*.").is_err());
        assert!(validate_domain("-bad.org").is_err());
        assert!(validate_domain("bad-.org").is_err());
        assert!(validate_domain("sp ace.org").is_err());
        assert!(validate_domain("under_score.org").is_err());
    }

    #[test]
    fn test_ports_and_protocols() {
        assert!(validate_port(1).is_ok());
        assert!(validate_port(443).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());

        assert!(validate_protocol("TCP").is_ok());
        assert!(validate_protocol("UDP").is_ok());
        assert!(validate_protocol("tcp").is_err());
        assert!(validate_protocol("ICMP").is_err());
    }

    #[test]
    fn test_package_names() {
        assert!(validate_package_name("requests").is_ok());
        assert!(validate_package_name("numpy==1.26.4").is_ok());
        assert!(validate_package_name("@types/node").is_ok());

        assert!(validate_package_name("").is_err());
        assert!(validate_package_name("requests; rm -rf /").is_err());
        assert!(validate_package_name("a&&b").is_err());
        assert!(validate_package_name("a|b").is_err());
        assert!(validate_package_name("a>b").is_err());
        assert!(validate_package_name("a$b").is_err());
        assert!(validate_package_name("a`id`").is_err());
        assert!(validate_package_name("a\"b").is_err());
        assert!(validate_package_name("a'b").is_err());
        assert!(validate_package_name("a b").is_err());
    }

    #[test]
    fn test_sandbox_paths() {
        assert!(validate_sandbox_path("/workspace/main.py").is_ok());
        assert!(validate_sandbox_path("/tmp/data.csv").is_ok());

        assert!(validate_sandbox_path("").is_err());
        assert!(validate_sandbox_path("relative/path").is_err());
        assert!(validate_sandbox_path("/workspace/../etc/passwd").is_err());
        assert!(validate_sandbox_path("/tmp/$(id)").is_err());
        assert!(validate_sandbox_path("/tmp/it's").is_err());
    }

    #[test]
    fn test_sanitize_runtime_label() {
        assert_eq!(sanitize_runtime_label("python:3.10"), "python-3.10");
        assert_eq!(sanitize_runtime_label("node:20.11.1"), "node-20.11.1");
    }
}
