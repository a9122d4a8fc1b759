//! Startup command compilation and the pre-flight wrapper script.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Launch artifacts probed, in order, when a template uses `{{SERVER_JARFILE}}`.
pub const SERVER_FILE_CANDIDATES: &[&str] = &[
    "server.jar",
    "paper.jar",
    "purpur.jar",
    "spigot.jar",
    "forge.jar",
    "fabric-server-launch.jar",
    "minecraft_server.jar",
];

const SERVER_FILE_VAR: &str = "SERVER_JARFILE";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(?:env\.)?([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid regex")
    })
}

/// Replaces `{{VAR}}` (or `{{env.VAR}}`) with values from `vars`. Unknown
/// placeholders stay as written.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    placeholder_re()
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(v) => v.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Placeholders in `template` that `vars` cannot satisfy.
pub fn unresolved(template: &str, vars: &BTreeMap<String, String>) -> Vec<String> {
    placeholder_re()
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .filter(|k| !vars.contains_key(k))
        .collect()
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug, Clone, Default)]
pub struct StartupParams {
    pub memory_mb: u64,
    pub primary_port: Option<u16>,
    pub ip: String,
    pub env: BTreeMap<String, String>,
    pub accept_eula: bool,
}

impl StartupParams {
    /// Variables visible to templates: the instance environment plus resource
    /// parameters, which win on conflict.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut vars = self.env.clone();
        vars.insert("SERVER_MEMORY".to_string(), self.memory_mb.to_string());
        vars.insert("SERVER_IP".to_string(), self.ip.clone());
        if let Some(port) = self.primary_port {
            vars.insert("SERVER_PORT".to_string(), port.to_string());
        }
        vars
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStartup {
    /// The command line the server runs with.
    pub command: String,
    /// Shell script that prepares the data directory, then `exec`s the command.
    pub wrapper: String,
}

impl CompiledStartup {
    /// Arguments for a container whose entrypoint is `/bin/sh -c`.
    pub fn container_cmd(&self) -> Vec<String> {
        vec![self.wrapper.clone()]
    }
}

pub fn compile(template: &str, params: &StartupParams) -> CompiledStartup {
    let mut vars = params.variables();
    let probes_server_file = placeholder_re()
        .captures_iter(template)
        .any(|c| &c[1] == SERVER_FILE_VAR);
    if probes_server_file {
        vars.insert(SERVER_FILE_VAR.to_string(), "\"$SERVER_FILE\"".to_string());
    }
    let command = substitute(template, &vars);

    let mut wrapper = String::from("#!/bin/sh\n");
    if params.accept_eula {
        wrapper.push_str(
            "if [ ! -f eula.txt ]; then\n  echo 'eula=true' > eula.txt\n\
             elif grep -qi '^[[:space:]]*eula[[:space:]]*=[[:space:]]*false' eula.txt; then\n  \
             sed -i 's/^[[:space:]]*[Ee][Uu][Ll][Aa][[:space:]]*=.*/eula=true/' eula.txt\nfi\n",
        );
    }
    if probes_server_file {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(user) = params.env.get(SERVER_FILE_VAR).filter(|v| !v.trim().is_empty()) {
            candidates.push(user.trim().to_string());
        }
        for c in SERVER_FILE_CANDIDATES {
            if !candidates.iter().any(|x| x == c) {
                candidates.push(c.to_string());
            }
        }
        let list = candidates
            .iter()
            .map(|c| shell_quote(c))
            .collect::<Vec<_>>()
            .join(" ");
        wrapper.push_str(&format!(
            "SERVER_FILE={first}\nfor f in {list}; do\n  if [ -f \"$f\" ]; then SERVER_FILE=\"$f\"; break; fi\ndone\n",
            first = shell_quote(&candidates[0]),
        ));
    }
    wrapper.push_str("exec ");
    wrapper.push_str(&command);
    wrapper.push('\n');

    CompiledStartup { command, wrapper }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn memory_placeholder_from_environment() {
        let params = StartupParams {
            memory_mb: 1024,
            env: env(&[("MEM", "2048")]),
            ..Default::default()
        };
        let out = compile("run.sh -Xmx{{MEM}}M", &params);
        assert_eq!(out.command, "run.sh -Xmx2048M");
        assert!(out.wrapper.ends_with("exec run.sh -Xmx2048M\n"));
    }

    #[test]
    fn resource_parameters_and_unknown_placeholders() {
        let params = StartupParams {
            memory_mb: 3072,
            primary_port: Some(25565),
            ip: "0.0.0.0".to_string(),
            env: env(&[("SERVER_MEMORY", "1")]),
            ..Default::default()
        };
        let out = compile(
            "./srv --mem {{SERVER_MEMORY}} --port {{ SERVER_PORT }} --ip {{env.SERVER_IP}} --map {{MAP}}",
            &params,
        );
        assert_eq!(out.command, "./srv --mem 3072 --port 25565 --ip 0.0.0.0 --map {{MAP}}");
        assert_eq!(unresolved("{{MAP}} {{SERVER_IP}}", &params.variables()), vec!["MAP"]);
    }

    #[test]
    fn server_file_is_probed_in_priority_order() {
        let params = StartupParams {
            memory_mb: 2048,
            env: env(&[("SERVER_JARFILE", "custom.jar")]),
            accept_eula: true,
            ..Default::default()
        };
        let out = compile("java -Xmx{{SERVER_MEMORY}}M -jar {{SERVER_JARFILE}} nogui", &params);
        assert_eq!(out.command, "java -Xmx2048M -jar \"$SERVER_FILE\" nogui");
        assert!(out.wrapper.contains("for f in 'custom.jar' 'server.jar' 'paper.jar'"));
        assert!(out.wrapper.contains("SERVER_FILE='custom.jar'\n"));
        assert!(out.wrapper.contains("eula.txt"));
        assert!(out.wrapper.ends_with("exec java -Xmx2048M -jar \"$SERVER_FILE\" nogui\n"));
    }

    #[test]
    fn wrapper_without_fixups_just_execs() {
        let out = compile("./bedrock_server", &StartupParams::default());
        assert_eq!(out.wrapper, "#!/bin/sh\nexec ./bedrock_server\n");
        assert_eq!(out.container_cmd(), vec![out.wrapper.clone()]);
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }
}
