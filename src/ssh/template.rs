//! Per-connection command templating.
//!
//! Remote commands may name attributes of the connection they run on using
//! `{name}` placeholders, for example `echo {blade_hostname}:{local_port}`.
//! Literal braces are written `{{` and `}}`. Any other brace, or a
//! placeholder naming an unknown attribute, is an error.

use std::net::IpAddr;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::BladeError;

const PLACEHOLDER_PATTERN: &str = r"\{\{|\}\}|\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}|[{}]";

/// Values substituted into a command template.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TemplateValues<'a> {
    /// Blade type name.
    pub blade_type: &'a str,
    /// Zero-based instance number.
    pub instance: usize,
    /// Blade hostname.
    pub blade_hostname: &'a str,
    /// Port on the blade.
    pub remote_port: u16,
    /// Local tunnel address.
    pub local_ip: IpAddr,
    /// Local tunnel port while connected.
    pub local_port: Option<u16>,
}

impl TemplateValues<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "blade_type" => Some(self.blade_type.to_owned()),
            "instance" => Some(self.instance.to_string()),
            "blade_hostname" | "hostname" => Some(self.blade_hostname.to_owned()),
            "remote_port" => Some(self.remote_port.to_string()),
            "local_ip" => Some(self.local_ip.to_string()),
            "local_port" => self.local_port.map(|port| port.to_string()),
            _ => None,
        }
    }
}

fn placeholder_regex(command: &str) -> Result<&'static Regex, BladeError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(regex) = PATTERN.get() {
        return Ok(regex);
    }
    let compiled = Regex::new(PLACEHOLDER_PATTERN).map_err(|err| BladeError::Template {
        command: command.to_owned(),
        message: err.to_string(),
    })?;
    Ok(PATTERN.get_or_init(|| compiled))
}

/// Renders `command` against `values`.
///
/// # Errors
///
/// Returns [`BladeError::Template`] naming the literal command when a brace
/// is unbalanced or a placeholder cannot be resolved.
pub fn render_command(command: &str, values: &TemplateValues<'_>) -> Result<String, BladeError> {
    let regex = placeholder_regex(command)?;
    let mut rendered = String::with_capacity(command.len());
    let mut last = 0;
    for caps in regex.captures_iter(command) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        rendered.push_str(command.get(last..whole.start()).unwrap_or_default());
        rendered.push_str(&substitute(command, &caps, values)?);
        last = whole.end();
    }
    rendered.push_str(command.get(last..).unwrap_or_default());
    Ok(rendered)
}

fn substitute(
    command: &str,
    caps: &Captures<'_>,
    values: &TemplateValues<'_>,
) -> Result<String, BladeError> {
    let token = caps.get(0).map_or("", |m| m.as_str());
    match token {
        "{{" => return Ok(String::from("{")),
        "}}" => return Ok(String::from("}")),
        _ => {}
    }
    let Some(name) = caps.get(1).map(|m| m.as_str()) else {
        let offset = caps.get(0).map_or(0, |m| m.start());
        return Err(BladeError::Template {
            command: command.to_owned(),
            message: format!("unmatched '{token}' at offset {offset}"),
        });
    };
    values.lookup(name).ok_or_else(|| BladeError::Template {
        command: command.to_owned(),
        message: format!("'{name}' is not defined for this connection"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::Ipv4Addr;

    fn values() -> TemplateValues<'static> {
        TemplateValues {
            blade_type: "compute",
            instance: 2,
            blade_hostname: "compute-003",
            remote_port: 22,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: Some(41_234),
        }
    }

    #[rstest]
    #[case("echo {blade_hostname}", "echo compute-003")]
    #[case("echo {hostname}", "echo compute-003")]
    #[case(
        "{blade_type}/{instance} {local_ip}:{local_port}->{remote_port}",
        "compute/2 127.0.0.1:41234->22"
    )]
    #[case("echo { instance }", "echo 2")]
    #[case("awk '{{print $1}}' /etc/hosts", "awk '{print $1}' /etc/hosts")]
    #[case("uname -a", "uname -a")]
    fn renders_connection_attributes(#[case] template: &str, #[case] expected: &str) {
        let rendered = render_command(template, &values()).expect("template should render");
        assert_eq!(rendered, expected);
    }

    #[rstest]
    #[case("echo {nonexistent}", "'nonexistent' is not defined")]
    #[case("echo {blade_hostname", "unmatched '{' at offset 5")]
    #[case("awk '{print $1}'", "unmatched '{'")]
    fn rejects_bad_templates(#[case] template: &str, #[case] fragment: &str) {
        let err = render_command(template, &values()).expect_err("template should fail");
        match &err {
            BladeError::Template { command, message } => {
                assert_eq!(command, template);
                assert!(message.contains(fragment), "unexpected message: {message}");
            }
            other => panic!("expected a template error, got {other:?}"),
        }
    }

    #[test]
    fn local_port_is_unavailable_once_disconnected() {
        let disconnected = TemplateValues {
            local_port: None,
            ..values()
        };
        let err = render_command("nc {local_ip} {local_port}", &disconnected)
            .expect_err("missing port should fail");
        assert!(matches!(err, BladeError::Template { .. }), "got {err:?}");
    }
}
