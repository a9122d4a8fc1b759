//! Blueprint ("egg") documents: loading, validation and variable resolution.
//!
//! Eggs live under the catalog root as `<seg>/.../egg-<name>.json` and are
//! referenced as `seg/.../name`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Variable {
    pub name: String,
    pub env_variable: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_value: String,
    #[serde(default = "yes")]
    pub user_viewable: bool,
    #[serde(default = "yes")]
    pub user_editable: bool,
    /// Pipe-separated rule list, e.g. `required|integer|min:512`.
    #[serde(default)]
    pub rules: String,
}

fn yes() -> bool {
    true
}

impl Variable {
    pub fn is_required(&self) -> bool {
        rule_list(&self.rules).iter().any(|r| *r == "required")
    }

    pub fn validate(&self, value: &str) -> std::result::Result<(), String> {
        validate_rules(&self.rules, value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InstallDescriptor {
    /// Preferred installer image; the installer fallback chain follows it.
    pub container: Option<String>,
    pub entrypoint: String,
    pub script: String,
}

/// A validated, immutable blueprint. Instances keep a copy of this.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Blueprint {
    pub reference: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Runtime image candidates, most preferred first.
    pub images: Vec<String>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub install: Option<InstallDescriptor>,
    pub startup: String,
    pub stop_signal: String,
    /// Raw `config.stop` value when it names a console command rather than a signal.
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
}

impl Blueprint {
    /// Whether the server refuses to boot until a license file is accepted.
    pub fn requires_eula(&self) -> bool {
        self.features.iter().any(|f| f.eq_ignore_ascii_case("eula"))
            || self.startup.contains("SERVER_JARFILE")
            || self.startup.contains(".jar")
    }

    pub fn variable(&self, env_key: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.env_variable == env_key)
    }

    /// Merges schema defaults with `user` values and validates the result.
    ///
    /// Keys the schema does not declare pass through unchanged. Every problem is
    /// reported at once, keyed by environment variable.
    pub fn resolve_variables(
        &self,
        user: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let mut field_errors = BTreeMap::new();

        for var in &self.variables {
            let value = match user.get(&var.env_variable) {
                Some(v) if !var.user_editable && *v != var.default_value => {
                    field_errors.insert(
                        var.env_variable.clone(),
                        format!("{} cannot be changed", var.name),
                    );
                    continue;
                }
                Some(v) => v.clone(),
                None => var.default_value.clone(),
            };
            if let Err(msg) = var.validate(&value) {
                field_errors.insert(var.env_variable.clone(), format!("{} {msg}", var.name));
                continue;
            }
            out.insert(var.env_variable.clone(), value);
        }

        for (key, value) in user {
            if self.variable(key).is_some() {
                continue;
            }
            if !is_env_key(key) {
                field_errors.insert(key.clone(), "not a valid environment variable name".into());
                continue;
            }
            out.insert(key.clone(), value.clone());
        }

        if !field_errors.is_empty() {
            return Err(OrchestratorError::invalid_fields(
                "invalid variables",
                field_errors,
            ));
        }
        Ok(out)
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits a rule string on `|`, keeping a trailing `regex:` rule intact since
/// patterns may contain pipes themselves.
fn rule_list(rules: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = rules.trim();
    while !rest.is_empty() {
        if rest.starts_with("regex:") {
            out.push(rest);
            break;
        }
        match rest.split_once('|') {
            Some((head, tail)) => {
                if !head.trim().is_empty() {
                    out.push(head.trim());
                }
                rest = tail.trim_start();
            }
            None => {
                out.push(rest.trim());
                break;
            }
        }
    }
    out
}

pub fn validate_rules(rules: &str, value: &str) -> std::result::Result<(), String> {
    let rules = rule_list(rules);
    let has = |name: &str| rules.iter().any(|r| *r == name);

    if value.is_empty() {
        if has("required") {
            return Err("is required".to_string());
        }
        return Ok(());
    }

    let numeric = has("numeric") || has("integer");
    if has("integer") && value.parse::<i64>().is_err() {
        return Err("must be an integer".to_string());
    }
    if has("numeric") && value.parse::<f64>().is_err() {
        return Err("must be numeric".to_string());
    }
    if has("boolean") && !matches!(value, "true" | "false" | "1" | "0") {
        return Err("must be true or false".to_string());
    }

    for rule in &rules {
        let Some((name, arg)) = rule.split_once(':') else {
            continue;
        };
        match name {
            "min" | "max" => {
                let Ok(bound) = arg.trim().parse::<f64>() else {
                    continue;
                };
                let actual = if numeric {
                    value.parse::<f64>().unwrap_or(0.0)
                } else {
                    value.chars().count() as f64
                };
                let unit = if numeric { "" } else { " characters" };
                if name == "min" && actual < bound {
                    return Err(format!("must be at least {arg}{unit}"));
                }
                if name == "max" && actual > bound {
                    return Err(format!("must be at most {arg}{unit}"));
                }
            }
            "in" => {
                if !arg.split(',').any(|opt| opt.trim() == value) {
                    return Err(format!("must be one of: {arg}"));
                }
            }
            "regex" => {
                let Some(re) = compile_rule_regex(arg) else {
                    return Err("has an unusable validation pattern".to_string());
                };
                if !re.is_match(value) {
                    return Err("has an invalid format".to_string());
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Accepts `/pattern/flags` (only `i` is honoured) or a bare pattern.
fn compile_rule_regex(raw: &str) -> Option<Regex> {
    let raw = raw.trim();
    let (pattern, case_insensitive) = match raw.strip_prefix('/').and_then(|r| r.rsplit_once('/')) {
        Some((p, flags)) => (p, flags.contains('i')),
        None => (raw, false),
    };
    let pattern = if case_insensitive {
        format!("(?i){pattern}")
    } else {
        pattern.to_string()
    };
    Regex::new(&pattern).ok()
}

/// Maps an egg's `config.stop` to a signal name and, when it is a console
/// command, keeps the command.
pub fn stop_signal_for(stop: Option<&str>) -> (String, Option<String>) {
    match stop.map(str::trim).filter(|s| !s.is_empty()) {
        Some("^C") | Some("^c") => ("SIGINT".to_string(), None),
        Some(s) if s.starts_with("SIG") => (s.to_string(), None),
        Some(cmd) => ("SIGTERM".to_string(), Some(cmd.to_string())),
        None => ("SIGTERM".to_string(), None),
    }
}

// On-disk egg layout.

#[derive(Debug, serde::Deserialize)]
struct EggFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    docker_images: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    docker_image: Option<String>,
    #[serde(default)]
    startup: Option<String>,
    #[serde(default)]
    config: Option<EggConfig>,
    #[serde(default)]
    scripts: Option<EggScripts>,
    #[serde(default)]
    variables: Vec<EggVariable>,
    #[serde(default)]
    features: Option<Vec<String>>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct EggConfig {
    #[serde(default)]
    stop: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct EggScripts {
    #[serde(default)]
    installation: Option<EggInstall>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct EggInstall {
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    container: Option<String>,
    #[serde(default)]
    entrypoint: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct EggVariable {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    env_variable: String,
    #[serde(default)]
    default_value: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "loose_bool")]
    user_viewable: Option<bool>,
    #[serde(default, deserialize_with = "loose_bool")]
    user_editable: Option<bool>,
    #[serde(default)]
    rules: Option<String>,
}

/// Older eggs store flags as `0`/`1` or strings.
fn loose_bool<'de, D>(de: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v: Option<serde_json::Value> = serde::Deserialize::deserialize(de)?;
    Ok(match v {
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::Number(n)) => Some(n.as_i64().unwrap_or(0) != 0),
        Some(serde_json::Value::String(s)) => Some(matches!(s.trim(), "1" | "true")),
        _ => None,
    })
}

fn scalar_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl EggFile {
    fn into_blueprint(self, reference: &str) -> Result<Blueprint> {
        let name = self.name.map(|n| n.trim().to_string()).unwrap_or_default();
        if name.is_empty() {
            tracing::warn!(blueprint = %reference, "blueprint has no display name; excluded");
            return Err(OrchestratorError::not_found("blueprint", reference));
        }

        let mut images: Vec<String> = self
            .docker_images
            .map(|m| {
                m.values()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .collect()
            })
            .unwrap_or_default();
        if let Some(legacy) = self.docker_image.map(|s| s.trim().to_string())
            && !legacy.is_empty()
            && !images.contains(&legacy)
        {
            images.push(legacy);
        }
        images.retain(|i| !i.is_empty());
        if images.is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "blueprint {reference} declares no runtime image"
            )));
        }

        let startup = self.startup.unwrap_or_default().trim().to_string();
        if startup.is_empty() {
            return Err(OrchestratorError::invalid(format!(
                "blueprint {reference} has no startup command"
            )));
        }

        let install = self
            .scripts
            .and_then(|s| s.installation)
            .and_then(|i| {
                let script = i.script.unwrap_or_default();
                if script.trim().is_empty() {
                    return None;
                }
                Some(InstallDescriptor {
                    container: i.container.filter(|c| !c.trim().is_empty()),
                    entrypoint: i
                        .entrypoint
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "bash".to_string()),
                    script,
                })
            });

        let mut variables = Vec::with_capacity(self.variables.len());
        for v in self.variables {
            if !is_env_key(&v.env_variable) {
                return Err(OrchestratorError::invalid(format!(
                    "blueprint {reference} has an invalid variable key {:?}",
                    v.env_variable
                )));
            }
            variables.push(Variable {
                name: v.name.unwrap_or_else(|| v.env_variable.clone()),
                description: v.description.unwrap_or_default(),
                default_value: v.default_value.as_ref().map(scalar_to_string).unwrap_or_default(),
                user_viewable: v.user_viewable.unwrap_or(true),
                user_editable: v.user_editable.unwrap_or(true),
                rules: v.rules.unwrap_or_default(),
                env_variable: v.env_variable,
            });
        }

        let (stop_signal, stop_command) =
            stop_signal_for(self.config.as_ref().and_then(|c| c.stop.as_deref()));

        Ok(Blueprint {
            reference: reference.to_string(),
            name,
            description: self.description.unwrap_or_default(),
            author: self.author.unwrap_or_default(),
            images,
            variables,
            install,
            startup,
            stop_signal,
            stop_command,
            features: self.features.unwrap_or_default(),
        })
    }
}

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid regex"))
}

/// Loads blueprints from the egg catalog directory.
#[derive(Debug, Clone)]
pub struct BlueprintResolver {
    root: PathBuf,
}

impl BlueprintResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, reference: &str) -> Option<PathBuf> {
        let segments: Vec<&str> = reference.trim().trim_matches('/').split('/').collect();
        if segments.iter().any(|s| !segment_re().is_match(s) || s.contains("..")) {
            return None;
        }
        let (name, dirs) = segments.split_last()?;
        let mut path = self.root.clone();
        for d in dirs {
            path.push(d);
        }
        path.push(format!("egg-{name}.json"));
        Some(path)
    }

    pub fn resolve(&self, reference: &str) -> Result<Blueprint> {
        let reference = reference.trim().trim_matches('/');
        let Some(path) = self.path_for(reference) else {
            return Err(OrchestratorError::invalid(format!(
                "invalid blueprint reference {reference:?}"
            )));
        };
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestratorError::not_found("blueprint", reference));
            }
            Err(e) => return Err(e.into()),
        };
        parse_egg(&raw, reference)
    }
}

pub fn parse_egg(raw: &[u8], reference: &str) -> Result<Blueprint> {
    let egg: EggFile = serde_json::from_slice(raw).map_err(|e| {
        OrchestratorError::invalid(format!("blueprint {reference} is not valid JSON: {e}"))
    })?;
    egg.into_blueprint(reference)
}
